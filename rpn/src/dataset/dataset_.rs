use super::GroundTruth;
use crate::common::*;

/// An image with its annotated objects.
#[derive(Debug)]
pub struct DataRecord {
    /// Image in shape `[3, height, width]` with values in `[0, 1]`.
    pub image: Tensor,
    /// Boxes in pixels of `image`.
    pub ground_truth: GroundTruth,
}

/// The dataset that can be random accessed.
pub trait RandomAccessDataset
where
    Self: Debug + Send + Sync,
{
    /// Get number of records in the dataset.
    fn num_records(&self) -> usize;

    /// Get the nth record in the dataset.
    fn nth(&self, index: usize) -> Result<DataRecord>;
}

impl<D> RandomAccessDataset for Arc<D>
where
    D: RandomAccessDataset + ?Sized,
{
    fn num_records(&self) -> usize {
        (**self).num_records()
    }

    fn nth(&self, index: usize) -> Result<DataRecord> {
        (**self).nth(index)
    }
}
