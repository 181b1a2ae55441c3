use super::{CacheLoader, DataRecord, GroundTruth, LabelIndex, RandomAccessDataset};
use crate::common::*;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Images of a directory paired with their labels.
///
/// Images are listed in sorted order. Images are resized by the cache loader
/// and their boxes are rescaled by the same factors. Images without a label
/// entry yield an empty ground truth.
#[derive(Debug)]
pub struct ImageDataset {
    image_files: Vec<PathBuf>,
    labels: LabelIndex,
    loader: CacheLoader,
}

impl ImageDataset {
    pub fn load<P>(image_dir: P, labels: LabelIndex, loader: CacheLoader) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let image_dir = image_dir.as_ref();
        let mut image_files: Vec<_> = fs::read_dir(image_dir)
            .with_context(|| format!("failed to read image dir '{}'", image_dir.display()))?
            .map(|entry| -> Result<_> { Ok(entry?.path()) })
            .filter_ok(|path| is_image_file(path))
            .collect::<Result<_>>()?;
        image_files.sort();

        let num_labeled = image_files
            .iter()
            .filter(|path| labels.get(path).is_some())
            .count();
        info!(
            "found {} images ({} labeled) in '{}'",
            image_files.len(),
            num_labeled,
            image_dir.display()
        );

        Ok(Self {
            image_files,
            labels,
            loader,
        })
    }

    pub fn image_files(&self) -> &[PathBuf] {
        &self.image_files
    }
}

impl RandomAccessDataset for ImageDataset {
    fn num_records(&self) -> usize {
        self.image_files.len()
    }

    fn nth(&self, index: usize) -> Result<DataRecord> {
        let image_path = self
            .image_files
            .get(index)
            .ok_or_else(|| format_err!("invalid index {}", index))?;
        let cached = self.loader.load(image_path)?;

        let ground_truth = match self.labels.get(image_path) {
            Some(item) => {
                let (image_h, image_w) = self.loader.image_size();
                item.to_ground_truth(index)
                    .with_context(|| format!("invalid label of '{}'", image_path.display()))?
                    .scale_hw(
                        image_h as f64 / cached.orig_h as f64,
                        image_w as f64 / cached.orig_w as f64,
                    )?
            }
            None => GroundTruth::empty(index),
        };

        Ok(DataRecord {
            image: cached.image,
            ground_truth,
        })
    }
}

fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_lowercase();
                IMAGE_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or(false)
}
