use crate::{common::*, error::RpnError};
use image::{imageops::FilterType, io::Reader as ImageReader, FlatSamples};
use percent_encoding::NON_ALPHANUMERIC;

const IMAGE_CHANNELS: usize = 3;

/// Loads images resized to a fixed size, caching the pixels as raw `f32` data.
#[derive(Debug, Clone)]
pub struct CacheLoader {
    cache_dir: PathBuf,
    image_h: usize,
    image_w: usize,
    device: Device,
}

/// A resized image and the size of its source file.
#[derive(Debug)]
pub struct CachedImage {
    /// Image in shape `[3, image_h, image_w]` with values in `[0, 1]`.
    pub image: Tensor,
    pub orig_h: usize,
    pub orig_w: usize,
}

impl CacheLoader {
    pub fn new<P>(
        cache_dir: P,
        image_h: usize,
        image_w: usize,
        device: impl Into<Option<Device>>,
    ) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        if image_h == 0 || image_w == 0 {
            return Err(RpnError::InvalidConfig(format!(
                "image size must be positive, but get {}x{}",
                image_h, image_w
            ))
            .into());
        }

        let cache_dir = cache_dir.as_ref().to_owned();
        fs::create_dir_all(&cache_dir).with_context(|| {
            format!("failed to create cache dir '{}'", cache_dir.display())
        })?;

        Ok(Self {
            cache_dir,
            image_h,
            image_w,
            device: device.into().unwrap_or(Device::Cpu),
        })
    }

    pub fn image_size(&self) -> (usize, usize) {
        (self.image_h, self.image_w)
    }

    /// Path of the cache file of `image_path`.
    pub fn cache_path(&self, image_path: &Path) -> PathBuf {
        self.cache_dir.join(format!(
            "{}-{}-{}-{}",
            percent_encoding::utf8_percent_encode(&image_path.to_string_lossy(), NON_ALPHANUMERIC),
            IMAGE_CHANNELS,
            self.image_h,
            self.image_w,
        ))
    }

    pub fn load<P>(&self, image_path: P) -> Result<CachedImage>
    where
        P: AsRef<Path>,
    {
        let Self {
            image_h,
            image_w,
            device,
            ..
        } = *self;
        let image_path = image_path.as_ref();

        let (orig_h, orig_w) = {
            let imagesize::ImageSize { height, width } = imagesize::size(image_path)
                .with_context(|| format!("failed to read size of '{}'", image_path.display()))?;
            (height, width)
        };

        let cache_components = image_h * image_w * IMAGE_CHANNELS;
        let cache_bytes = cache_components * mem::size_of::<f32>();
        let cache_path = self.cache_path(image_path);

        // the cache is valid if it is newer than the image and has the expected size
        let is_valid = if cache_path.is_file() {
            let image_modified = image_path.metadata()?.modified()?;
            let cache_meta = cache_path.metadata()?;
            cache_meta.modified()? > image_modified && cache_meta.len() == cache_bytes as u64
        } else {
            false
        };

        let image = if is_valid {
            debug!("load cached image '{}'", cache_path.display());
            Tensor::f_from_file(
                &cache_path.to_string_lossy(),
                false,
                Some(cache_components as i64),
                FLOAT_CPU,
            )?
            .view([IMAGE_CHANNELS as i64, image_h as i64, image_w as i64])
        } else {
            let FlatSamples { samples, .. } = ImageReader::open(image_path)
                .with_context(|| format!("failed to open {}", image_path.display()))?
                .with_guessed_format()
                .with_context(|| {
                    format!(
                        "failed to determine the image file format: {}",
                        image_path.display()
                    )
                })?
                .decode()
                .with_context(|| format!("failed to decode image file: {}", image_path.display()))?
                .resize_exact(image_w as u32, image_h as u32, FilterType::CatmullRom)
                .to_rgb8()
                .into_flat_samples();
            debug_assert_eq!(samples.len(), cache_components);

            let image = tch::no_grad(|| {
                (Tensor::of_slice(&samples).to_kind(Kind::Float) / 255.0)
                    .view([image_h as i64, image_w as i64, IMAGE_CHANNELS as i64])
                    .permute(&[2, 0, 1])
                    .contiguous()
            });

            let mut buffer = vec![0; cache_bytes];
            image.copy_data_u8(&mut buffer, cache_components);
            fs::write(&cache_path, &buffer)
                .with_context(|| format!("failed to write cache '{}'", cache_path.display()))?;

            image
        };

        Ok(CachedImage {
            image: image.to_device(device).set_requires_grad(false),
            orig_h,
            orig_w,
        })
    }
}
