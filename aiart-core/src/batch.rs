/// Ordered batch sizes for one request. Always sums to the image count.
///
/// Sizes are computed on demand, so a plan costs the same whatever the
/// image count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchPlan {
    image_count: usize,
    batch_size: usize,
    batch_count: usize,
}

impl BatchPlan {
    /// Splits `image_count` into batches of `batch_size`, the last one
    /// holding the remainder.
    ///
    /// A missing (or zero) batch size generates every image in one call.
    pub fn new(image_count: usize, batch_size: Option<usize>) -> Self {
        match batch_size.filter(|&size| size > 0) {
            None => Self {
                image_count,
                batch_size: image_count,
                batch_count: 1,
            },
            Some(batch_size) => Self {
                image_count,
                batch_size,
                batch_count: image_count.div_ceil(batch_size),
            },
        }
    }

    /// Size of batch `index`, or `None` past the last batch.
    pub fn size(&self, index: usize) -> Option<usize> {
        if index >= self.batch_count {
            None
        } else if index + 1 == self.batch_count {
            Some(self.image_count - self.batch_size * (self.batch_count - 1))
        } else {
            Some(self.batch_size)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.batch_count).filter_map(|index| self.size(index))
    }

    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    pub fn image_count(&self) -> usize {
        self.image_count
    }
}
