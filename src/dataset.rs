use std::fs;
use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageBuffer, Luma, Rgb};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::info;

use crate::config::{Direction, TrainingConfig};
use crate::error::{DesmokeError, Result};
use crate::networks::GENERATOR_MIN_SIZE;

pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Sorted image files of one directory.
pub struct ImageFolder {
    pub size: usize,
    pub image_paths: Vec<PathBuf>,
}

impl ImageFolder {
    pub fn directory(dir_path: impl AsRef<Path>) -> Result<Self> {
        let path = dir_path.as_ref();
        if !path.is_dir() {
            return Err(DesmokeError::MissingDirectory(path.to_path_buf()));
        }

        let mut image_paths = Vec::new();
        for entry in fs::read_dir(path)? {
            let path = entry?.path();
            if path.is_file() && is_image_file(&path) {
                image_paths.push(path);
            }
        }
        if image_paths.is_empty() {
            return Err(DesmokeError::EmptyDirectory(path.to_path_buf()));
        }

        image_paths.sort();
        let size = image_paths.len();
        info!("Loaded {} images from {}", size, path.display());

        Ok(Self { size, image_paths })
    }

    pub fn path(&self, idx: usize) -> Result<&Path> {
        self.image_paths
            .get(idx)
            .map(PathBuf::as_path)
            .ok_or(DesmokeError::IndexOutOfBounds {
                index: idx,
                size: self.size,
            })
    }
}

/// Resize, crop and flip applied to every image before it becomes a tensor.
#[derive(Debug, Clone)]
pub struct Transform {
    pub load_size: u32,
    pub crop_size: u32,
    pub flip: bool,
    pub channels: usize,
}

impl Transform {
    /// Resize to `load_size`, random `crop_size` crop, random horizontal flip.
    pub fn train(config: &TrainingConfig, channels: usize) -> Self {
        Self {
            load_size: config.load_size,
            crop_size: config.crop_size,
            flip: !config.no_flip,
            channels,
        }
    }

    /// Resize straight to `crop_size`, no randomness.
    pub fn test(config: &TrainingConfig, channels: usize) -> Self {
        Self {
            load_size: config.crop_size,
            crop_size: config.crop_size,
            flip: false,
            channels,
        }
    }

    pub fn apply<R: Rng + ?Sized>(&self, img: DynamicImage, rng: &mut R) -> DynamicImage {
        let mut img = img.resize_exact(self.load_size, self.load_size, FilterType::CatmullRom);

        if self.crop_size < self.load_size {
            let max_offset = self.load_size - self.crop_size;
            let x = rng.random_range(0..=max_offset);
            let y = rng.random_range(0..=max_offset);
            img = img.crop_imm(x, y, self.crop_size, self.crop_size);
        }

        if self.flip && rng.random::<f32>() > 0.5 {
            img = img.fliph();
        }
        img
    }
}

/// Rounds both sides down to a multiple of 4 so the generator's two
/// downsamplings line up with its upsamplings. Images with a side below
/// [`GENERATOR_MIN_SIZE`] are rejected.
pub fn fit_to_generator(img: DynamicImage) -> Result<DynamicImage> {
    let min = GENERATOR_MIN_SIZE as u32;
    if img.width() < min || img.height() < min {
        return Err(DesmokeError::Config(format!(
            "{}x{} image is smaller than the generator minimum of {min}x{min}",
            img.width(),
            img.height()
        )));
    }
    let width = img.width() / 4 * 4;
    let height = img.height() / 4 * 4;
    if width == img.width() && height == img.height() {
        Ok(img)
    } else {
        Ok(img.resize_exact(width, height, FilterType::CatmullRom))
    }
}

/// `[1, C, H, W]` tensor in `[-1, 1]`; `channels` is 1 (luma) or 3 (RGB).
pub fn image_to_tensor<B: Backend>(img: &DynamicImage, channels: usize, device: &B::Device) -> Tensor<B, 4> {
    let (width, height) = (img.width() as usize, img.height() as usize);
    let mut data = vec![Vec::with_capacity(height * width); channels];

    if channels == 1 {
        for p in img.to_luma8().pixels() {
            data[0].push((p[0] as f32 / 255.0) * 2.0 - 1.0);
        }
    } else {
        for p in img.to_rgb8().pixels() {
            data[0].push((p[0] as f32 / 255.0) * 2.0 - 1.0);
            data[1].push((p[1] as f32 / 255.0) * 2.0 - 1.0);
            data[2].push((p[2] as f32 / 255.0) * 2.0 - 1.0);
        }
    }

    let flat: Vec<f32> = data.into_iter().flatten().collect();
    Tensor::<B, 1>::from_floats(flat.as_slice(), device).reshape([1, channels, height, width])
}

pub fn load_image_tensor<B: Backend, R: Rng + ?Sized>(
    path: &Path,
    transform: &Transform,
    rng: &mut R,
    device: &B::Device,
) -> Result<Tensor<B, 4>> {
    let img = transform.apply(image::open(path)?, rng);
    Ok(image_to_tensor(&img, transform.channels, device))
}

/// Writes the first image of a `[N, C, H, W]` batch in `[-1, 1]` to `path`.
pub fn save_tensor_as_image<B: Backend>(tensor: Tensor<B, 4>, path: &Path) -> Result<()> {
    let [_batch, channels, height, width] = tensor.dims();

    let values: Vec<f32> = tensor
        .slice([0..1])
        .to_data()
        .to_vec()
        .map_err(|e| DesmokeError::TensorData(format!("{e:?}")))?;

    // [-1, 1] -> [0, 255], still channel-major
    let pixels: Vec<u8> = values
        .iter()
        .map(|&x| ((x + 1.0) * 127.5).round().clamp(0.0, 255.0) as u8)
        .collect();
    let plane = height * width;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    if channels == 1 {
        let img: GrayImage = ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
            Luma([pixels[y as usize * width + x as usize]])
        });
        img.save(path)?;
    } else {
        let img = ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
            let idx = y as usize * width + x as usize;
            Rgb([pixels[idx], pixels[plane + idx], pixels[2 * plane + idx]])
        });
        img.save(path)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Train,
    Test,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Test => "test",
        }
    }
}

/// Two independent image folders, `<root>/<phase>A` and `<root>/<phase>B`.
pub struct UnalignedDataset {
    a: ImageFolder,
    b: ImageFolder,
    transform_a: Transform,
    transform_b: Transform,
    serial_batches: bool,
}

impl UnalignedDataset {
    /// With `direction == BtoA` the `B` folder feeds domain A and vice versa.
    pub fn open(root: impl AsRef<Path>, phase: Phase, config: &TrainingConfig) -> Result<Self> {
        let root = root.as_ref();
        let dir_a = root.join(format!("{}A", phase.as_str()));
        let dir_b = root.join(format!("{}B", phase.as_str()));
        let (dir_a, dir_b) = match config.direction {
            Direction::AtoB => (dir_a, dir_b),
            Direction::BtoA => (dir_b, dir_a),
        };

        let transform = match phase {
            Phase::Train => Transform::train,
            Phase::Test => Transform::test,
        };

        Ok(Self {
            a: ImageFolder::directory(dir_a)?,
            b: ImageFolder::directory(dir_b)?,
            transform_a: transform(config, config.input_nc),
            transform_b: transform(config, config.output_nc),
            serial_batches: config.serial_batches || phase == Phase::Test,
        })
    }

    pub fn len(&self) -> usize {
        self.a.size.max(self.b.size)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_a(&self) -> usize {
        self.a.size
    }

    pub fn len_b(&self) -> usize {
        self.b.size
    }

    /// Shuffled item order for one epoch.
    pub fn epoch_order<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if !self.serial_batches {
            order.shuffle(rng);
        }
        order
    }

    /// A image wraps around its folder; B is either paired by index or drawn at
    /// random so the pairing never settles.
    pub fn item_paths<R: Rng + ?Sized>(&self, index: usize, rng: &mut R) -> Result<(&Path, &Path)> {
        let a = self.a.path(index % self.a.size)?;
        let b_index = if self.serial_batches {
            index % self.b.size
        } else {
            rng.random_range(0..self.b.size)
        };
        Ok((a, self.b.path(b_index)?))
    }

    pub fn get<B: Backend, R: Rng + ?Sized>(
        &self,
        index: usize,
        rng: &mut R,
        device: &B::Device,
    ) -> Result<(Tensor<B, 4>, Tensor<B, 4>)> {
        if index >= self.len() {
            return Err(DesmokeError::IndexOutOfBounds {
                index,
                size: self.len(),
            });
        }
        let (path_a, path_b) = self.item_paths(index, rng)?;
        let real_a = load_image_tensor(path_a, &self.transform_a, rng, device)?;
        let real_b = load_image_tensor(path_b, &self.transform_b, rng, device)?;
        Ok((real_a, real_b))
    }

    pub fn get_batch<B: Backend, R: Rng + ?Sized>(
        &self,
        indices: &[usize],
        rng: &mut R,
        device: &B::Device,
    ) -> Result<(Tensor<B, 4>, Tensor<B, 4>)> {
        let mut batch_a = Vec::with_capacity(indices.len());
        let mut batch_b = Vec::with_capacity(indices.len());
        for &idx in indices {
            let (a, b) = self.get::<B, R>(idx, rng, device)?;
            batch_a.push(a);
            batch_b.push(b);
        }
        Ok((Tensor::cat(batch_a, 0), Tensor::cat(batch_b, 0)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::RgbImage;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type TestBackend = NdArray<f32>;

    pub(crate) fn scratch_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("desmoke-{label}-{}", std::process::id()));
        fs::remove_dir_all(&dir).ok();
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub(crate) fn write_solid(path: &Path, size: u32, color: [u8; 3]) {
        RgbImage::from_pixel(size, size, Rgb(color)).save(path).unwrap();
    }

    pub(crate) fn write_dataset(root: &Path, phase: &str, count_a: usize, count_b: usize, size: u32) {
        for (domain, count, color) in [("A", count_a, [200, 180, 170]), ("B", count_b, [150, 60, 50])] {
            let dir = root.join(format!("{phase}{domain}"));
            fs::create_dir_all(&dir).unwrap();
            for i in 0..count {
                write_solid(&dir.join(format!("{i:03}.png")), size, color);
            }
        }
    }

    #[test]
    fn folder_lists_sorted_images_only() {
        let dir = scratch_dir("folder");
        write_solid(&dir.join("b.PNG"), 4, [0, 0, 0]);
        write_solid(&dir.join("a.jpg"), 4, [0, 0, 0]);
        fs::write(dir.join("notes.txt"), "not an image").unwrap();
        fs::create_dir_all(dir.join("nested.png")).unwrap();

        let folder = ImageFolder::directory(&dir).unwrap();
        let names: Vec<_> = folder
            .image_paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.PNG"]);
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn missing_and_empty_folders_are_errors() {
        let dir = scratch_dir("empty");
        assert!(matches!(
            ImageFolder::directory(dir.join("absent")),
            Err(DesmokeError::MissingDirectory(_))
        ));
        assert!(matches!(ImageFolder::directory(&dir), Err(DesmokeError::EmptyDirectory(_))));
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn transform_crops_to_crop_size() {
        let transform = Transform {
            load_size: 20,
            crop_size: 16,
            flip: true,
            channels: 3,
        };
        let mut rng = StdRng::seed_from_u64(1);
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(37, 23, Rgb([1, 2, 3])));
        let out = transform.apply(img, &mut rng);
        assert_eq!((out.width(), out.height()), (16, 16));
    }

    #[test]
    fn fit_to_generator_rounds_down_to_multiples_of_four() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(37, 23));
        let out = fit_to_generator(img).unwrap();
        assert_eq!((out.width(), out.height()), (36, 20));
    }

    #[test]
    fn fit_to_generator_rejects_images_below_the_minimum() {
        let narrow = DynamicImage::ImageRgb8(RgbImage::new(7, 40));
        assert!(matches!(fit_to_generator(narrow), Err(DesmokeError::Config(_))));
        let smallest = DynamicImage::ImageRgb8(RgbImage::new(8, 11));
        let out = fit_to_generator(smallest).unwrap();
        assert_eq!((out.width(), out.height()), (8, 8));
    }

    #[test]
    fn tensor_round_trip_preserves_pixels() {
        let device = Default::default();
        let dir = scratch_dir("tensor");
        let mut img = RgbImage::new(4, 2);
        for (x, y, p) in img.enumerate_pixels_mut() {
            *p = Rgb([(x * 60) as u8, (y * 200) as u8, 17]);
        }
        let img = DynamicImage::ImageRgb8(img);

        let tensor = image_to_tensor::<TestBackend>(&img, 3, &device);
        assert_eq!(tensor.dims(), [1, 3, 2, 4]);

        let path = dir.join("out.png");
        save_tensor_as_image(tensor, &path).unwrap();
        assert_eq!(image::open(&path).unwrap().to_rgb8(), img.to_rgb8());
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn unaligned_dataset_wraps_the_smaller_domain() {
        let device = Default::default();
        let root = scratch_dir("unaligned");
        write_dataset(&root, "train", 3, 2, 8);

        let config = TrainingConfig::new("unit".into(), "unused".into())
            .with_load_size(8)
            .with_crop_size(8)
            .with_serial_batches(true);
        let dataset = UnalignedDataset::open(&root, Phase::Train, &config).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!((dataset.len_a(), dataset.len_b()), (3, 2));

        let mut rng = StdRng::seed_from_u64(0);
        let (_, b) = dataset.item_paths(2, &mut rng).unwrap();
        assert!(b.ends_with("trainB/000.png"));

        let (a, b) = dataset.get_batch::<TestBackend, _>(&[0, 2], &mut rng, &device).unwrap();
        assert_eq!(a.dims(), [2, 3, 8, 8]);
        assert_eq!(b.dims(), [2, 3, 8, 8]);
        assert!(dataset.get::<TestBackend, _>(3, &mut rng, &device).is_err());
        fs::remove_dir_all(root).ok();
    }

    #[test]
    fn reversed_direction_swaps_domains() {
        let root = scratch_dir("direction");
        write_dataset(&root, "train", 1, 4, 8);

        let config = TrainingConfig::new("unit".into(), "unused".into()).with_direction(Direction::BtoA);
        let dataset = UnalignedDataset::open(&root, Phase::Train, &config).unwrap();
        assert_eq!((dataset.len_a(), dataset.len_b()), (4, 1));
        fs::remove_dir_all(root).ok();
    }
}
