use super::{DataRecord, GroundTruth, RandomAccessDataset};
use crate::{common::*, error::RpnError};

/// Fractions of the train/validation/test split. The test subset takes the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitConfig {
    #[serde(default = "default_train_fraction")]
    pub train_fraction: R64,
    #[serde(default = "default_val_fraction")]
    pub val_fraction: R64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            train_fraction: default_train_fraction(),
            val_fraction: default_val_fraction(),
        }
    }
}

fn default_train_fraction() -> R64 {
    r64(0.7)
}

fn default_val_fraction() -> R64 {
    r64(0.15)
}

/// A view of a dataset restricted to the given indexes.
#[derive(Debug)]
pub struct Subset<D> {
    dataset: Arc<D>,
    indexes: Vec<usize>,
}

impl<D> Subset<D>
where
    D: RandomAccessDataset,
{
    pub fn new(dataset: Arc<D>, indexes: Vec<usize>) -> Result<Self> {
        let num_records = dataset.num_records();
        ensure!(
            indexes.iter().all(|&index| index < num_records),
            "subset index out of range of {} records",
            num_records
        );
        Ok(Self { dataset, indexes })
    }

    pub fn indexes(&self) -> &[usize] {
        &self.indexes
    }

    /// Keeps at most the first `limit` records.
    pub fn take(mut self, limit: usize) -> Self {
        self.indexes.truncate(limit);
        self
    }
}

impl<D> RandomAccessDataset for Subset<D>
where
    D: RandomAccessDataset,
{
    fn num_records(&self) -> usize {
        self.indexes.len()
    }

    fn nth(&self, index: usize) -> Result<DataRecord> {
        let &inner = self
            .indexes
            .get(index)
            .ok_or_else(|| format_err!("invalid index {}", index))?;
        self.dataset.nth(inner)
    }
}

#[derive(Debug)]
pub struct DatasetSplit<D> {
    pub train: Subset<D>,
    pub val: Subset<D>,
    pub test: Subset<D>,
}

/// Randomly partitions the dataset into disjoint train/validation/test subsets.
///
/// The train and validation sizes are rounded down.
pub fn random_split<D, R>(dataset: Arc<D>, config: &SplitConfig, rng: &mut R) -> Result<DatasetSplit<D>>
where
    D: RandomAccessDataset,
    R: Rng + ?Sized,
{
    let SplitConfig {
        train_fraction,
        val_fraction,
    } = *config;
    if train_fraction.raw() < 0.0
        || val_fraction.raw() < 0.0
        || train_fraction.raw() + val_fraction.raw() > 1.0
    {
        return Err(RpnError::InvalidConfig(format!(
            "invalid split fractions {} and {}",
            train_fraction, val_fraction
        ))
        .into());
    }

    let num_records = dataset.num_records();
    let num_train = (train_fraction.raw() * num_records as f64) as usize;
    let num_val = (val_fraction.raw() * num_records as f64) as usize;

    let mut indexes: Vec<_> = (0..num_records).collect();
    indexes.shuffle(rng);
    let test = indexes.split_off(num_train + num_val);
    let val = indexes.split_off(num_train);
    let train = indexes;

    info!(
        "split {} records into {} train, {} val and {} test",
        num_records,
        train.len(),
        val.len(),
        test.len()
    );

    Ok(DatasetSplit {
        train: Subset::new(dataset.clone(), train)?,
        val: Subset::new(dataset.clone(), val)?,
        test: Subset::new(dataset, test)?,
    })
}

/// Images stacked into one tensor with per image ground truth.
#[derive(Debug)]
pub struct Batch {
    /// Images in shape `[batch, 3, height, width]`.
    pub images: Tensor,
    pub ground_truths: Vec<GroundTruth>,
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.ground_truths.len()
    }

    /// Returns `(height, width)` of the images.
    pub fn image_size(&self) -> Result<(i64, i64)> {
        let (_b, _c, height, width) = self.images.size4()?;
        Ok((height, width))
    }

    /// Keeps the first `limit` images.
    pub fn truncate(self, limit: usize) -> Self {
        let Self {
            images,
            mut ground_truths,
        } = self;
        let limit = limit.min(ground_truths.len());
        ground_truths.truncate(limit);
        Self {
            images: images.narrow(0, 0, limit as i64),
            ground_truths,
        }
    }
}

/// Stacks records of equal image size into a batch.
pub fn collate(records: Vec<DataRecord>) -> Result<Batch> {
    ensure!(!records.is_empty(), "cannot collate an empty batch");

    let (_c, height, width) = records[0].image.size3()?;
    for record in &records[1..] {
        let (_c, other_h, other_w) = record.image.size3()?;
        if other_h != height {
            return Err(RpnError::shape_mismatch("batch image height", height, other_h).into());
        }
        if other_w != width {
            return Err(RpnError::shape_mismatch("batch image width", width, other_w).into());
        }
    }

    let (images, ground_truths): (Vec<_>, Vec<_>) = records
        .into_iter()
        .map(|record| (record.image, record.ground_truth))
        .unzip();

    Ok(Batch {
        images: Tensor::stack(&images, 0),
        ground_truths,
    })
}

/// Splits record positions into chunks of `batch_size`. The last chunk may be
/// smaller. Positions are shuffled if `rng` is given.
pub fn batch_indexes<R>(num_records: usize, batch_size: usize, rng: Option<&mut R>) -> Vec<Vec<usize>>
where
    R: Rng + ?Sized,
{
    let mut indexes: Vec<_> = (0..num_records).collect();
    if let Some(rng) = rng {
        indexes.shuffle(rng);
    }
    indexes
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Loads the records at `indexes` and collates them.
pub fn load_batch<D>(dataset: &D, indexes: &[usize]) -> Result<Batch>
where
    D: RandomAccessDataset + ?Sized,
{
    let records = indexes
        .iter()
        .map(|&index| dataset.nth(index))
        .collect::<Result<Vec<_>>>()?;
    collate(records)
}
