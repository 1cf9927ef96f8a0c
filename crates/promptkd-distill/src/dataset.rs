//! Pre-processed image datasets.
//!
//! A dataset directory looks like:
//!
//! ```text
//! <dir>/classnames.txt        one class name per line, in label order
//! <dir>/train.safetensors     images (N, 3, H, W) and labels (N)
//! <dir>/val.safetensors
//! <dir>/test.safetensors
//! ```
//!
//! Images are expected already resized and normalised for the backbone.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::info;

use crate::error::{DistillError, DistillResult};

/// One batch: `images` `(b, C, H, W)` and u32 `labels` `(b,)`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Tensor,
}

impl Batch {
    pub fn new(images: Tensor, labels: Tensor) -> DistillResult<Self> {
        let (b, _, _, _) = images
            .dims4()
            .map_err(|_| DistillError::InvalidBatch(format!("images must be (b, c, h, w), got {:?}", images.dims())))?;
        let n = labels
            .dims1()
            .map_err(|_| DistillError::InvalidBatch(format!("labels must be (b,), got {:?}", labels.dims())))?;
        if n != b {
            return Err(DistillError::InvalidBatch(format!("{b} images but {n} labels")));
        }
        if b == 0 {
            return Err(DistillError::InvalidBatch("empty batch".into()));
        }
        let labels = if labels.dtype() == DType::U32 { labels } else { labels.to_dtype(DType::U32)? };
        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_label(&self) -> DistillResult<u32> {
        Ok(self.labels.max(0)?.to_scalar::<u32>()?)
    }
}

/// Images and labels held in memory.
#[derive(Debug, Clone)]
pub struct TensorDataset {
    images: Tensor,
    labels: Tensor,
}

impl TensorDataset {
    pub fn new(images: Tensor, labels: Tensor) -> DistillResult<Self> {
        let checked = Batch::new(images, labels)?;
        Ok(Self { images: checked.images, labels: checked.labels })
    }

    /// Read `images` and `labels` from a safetensors file.
    pub fn load(path: &Path, device: &Device) -> DistillResult<Self> {
        if !path.exists() {
            return Err(DistillError::DataNotFound(path.to_path_buf()));
        }
        let mut tensors = candle_core::safetensors::load(path, device)?;
        let mut take = |key: &str| {
            tensors
                .remove(key)
                .ok_or_else(|| DistillError::InvalidBatch(format!("{} has no '{key}' tensor", path.display())))
        };
        let images = take("images")?.to_dtype(DType::F32)?;
        let labels = take("labels")?;
        let ds = Self::new(images, labels)?;
        info!(path = %path.display(), examples = ds.len(), "Dataset split loaded");
        Ok(ds)
    }

    pub fn len(&self) -> usize {
        self.labels.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.len().div_ceil(batch_size.max(1))
    }

    /// Consecutive batches in storage order; the last one may be short.
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = DistillResult<Batch>> + '_ {
        let size = batch_size.max(1);
        (0..self.num_batches(size)).map(move |i| {
            let start = i * size;
            let len = size.min(self.len() - start);
            Batch::new(self.images.narrow(0, start, len)?, self.labels.narrow(0, start, len)?)
        })
    }

    /// Batches gathered in `order`, a permutation of `0..len()`.
    pub fn batches_in_order<'a>(
        &'a self,
        order: &'a [u32],
        batch_size: usize,
    ) -> impl Iterator<Item = DistillResult<Batch>> + 'a {
        order.chunks(batch_size.max(1)).map(move |chunk| {
            if let Some(&bad) = chunk.iter().find(|&&i| i as usize >= self.len()) {
                return Err(DistillError::InvalidBatch(format!("index {bad} outside {} examples", self.len())));
            }
            let idx = Tensor::new(chunk, self.images.device())?;
            Batch::new(self.images.index_select(&idx, 0)?, self.labels.index_select(&idx, 0)?)
        })
    }
}

/// `0..n` in a random order drawn from `rng`.
pub fn shuffled_indices<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Vec<u32> {
    let mut order: Vec<u32> = (0..n as u32).collect();
    order.shuffle(rng);
    order
}

/// A directory holding class names and split files.
#[derive(Debug, Clone)]
pub struct DatasetDir {
    root: PathBuf,
}

impl DatasetDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Dataset name, taken from the directory name.
    pub fn name(&self) -> String {
        self.root.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
    }

    pub fn classnames(&self) -> DistillResult<Vec<String>> {
        read_classnames(&self.root.join("classnames.txt"))
    }

    /// Load `<split>.safetensors`, or `None` when the split is absent.
    pub fn split(&self, split: &str, device: &Device) -> DistillResult<Option<TensorDataset>> {
        let path = self.root.join(format!("{split}.safetensors"));
        if !path.exists() {
            return Ok(None);
        }
        TensorDataset::load(&path, device).map(Some)
    }
}

/// One class name per non-empty line.
pub fn read_classnames(path: &Path) -> DistillResult<Vec<String>> {
    if !path.exists() {
        return Err(DistillError::DataNotFound(path.to_path_buf()));
    }
    let names: Vec<String> = std::fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if names.is_empty() {
        return Err(DistillError::config("classnames", format!("{} lists no classes", path.display())));
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn dataset(n: usize) -> TensorDataset {
        let images = Tensor::zeros((n, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::arange(0i64, n as i64, &Device::Cpu).unwrap();
        TensorDataset::new(images, labels).unwrap()
    }

    #[test]
    fn test_batches_cover_dataset() {
        let ds = dataset(5);
        let sizes: Vec<usize> = ds.batches(2).map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        let last = ds.batches(2).last().unwrap().unwrap();
        assert_eq!(last.labels.dtype(), DType::U32);
        assert_eq!(last.max_label().unwrap(), 4);
    }

    #[test]
    fn test_batches_follow_given_order() {
        let ds = dataset(5);
        let order = [4u32, 0, 3, 1, 2];
        let labels: Vec<Vec<u32>> =
            ds.batches_in_order(&order, 2).map(|b| b.unwrap().labels.to_vec1::<u32>().unwrap()).collect();
        assert_eq!(labels, vec![vec![4, 0], vec![3, 1], vec![2]]);

        let err = ds.batches_in_order(&[7], 2).next().unwrap().unwrap_err();
        assert!(matches!(err, DistillError::InvalidBatch(_)));
    }

    #[test]
    fn test_shuffled_indices_is_a_seeded_permutation() {
        use rand::rngs::StdRng;
        use rand::SeedableRng;

        let a = shuffled_indices(64, &mut StdRng::seed_from_u64(3));
        let b = shuffled_indices(64, &mut StdRng::seed_from_u64(3));
        assert_eq!(a, b);
        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..64).collect::<Vec<u32>>());
        assert_ne!(a, sorted);
    }

    #[test]
    fn test_batch_rejects_mismatched_lengths() {
        let images = Tensor::zeros((2, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::zeros(3, DType::U32, &Device::Cpu).unwrap();
        assert!(matches!(Batch::new(images, labels), Err(DistillError::InvalidBatch(_))));
    }

    #[test]
    fn test_dataset_dir_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("classnames.txt"), "cat\n\nsea_lion\n").unwrap();
        let mut tensors = HashMap::new();
        tensors.insert("images".to_string(), Tensor::ones((3, 3, 4, 4), DType::F32, &Device::Cpu).unwrap());
        tensors.insert("labels".to_string(), Tensor::new(&[0i64, 1, 1], &Device::Cpu).unwrap());
        candle_core::safetensors::save(&tensors, dir.path().join("train.safetensors")).unwrap();

        let ds_dir = DatasetDir::new(dir.path());
        assert_eq!(ds_dir.classnames().unwrap(), vec!["cat", "sea_lion"]);
        let train = ds_dir.split("train", &Device::Cpu).unwrap().unwrap();
        assert_eq!(train.len(), 3);
        assert!(ds_dir.split("val", &Device::Cpu).unwrap().is_none());
    }

    #[test]
    fn test_missing_split_file() {
        let err = TensorDataset::load(Path::new("/nonexistent/train.safetensors"), &Device::Cpu).unwrap_err();
        assert!(matches!(err, DistillError::DataNotFound(_)));
    }
}
