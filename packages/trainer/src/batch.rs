use crate::{
    autograd::Rng,
    data::{Dataset, ImageShape},
};

/// A group of images in owned memory, sample-major HWC.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    shape: ImageShape,
    pixels: Vec<f32>,
}

impl Batch {
    pub fn from_pixels(shape: ImageShape, pixels: Vec<f32>) -> Self {
        let width = shape.pixels();
        assert!(width > 0, "image shape must be non-empty");
        assert_eq!(
            pixels.len() % width,
            0,
            "batch of {} values is not a whole number of {}-value images",
            pixels.len(),
            width
        );
        Self { shape, pixels }
    }

    pub fn len(&self) -> usize {
        self.pixels.len() / self.shape.pixels()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn shape(&self) -> ImageShape {
        self.shape
    }

    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }

    pub fn image(&self, index: usize) -> &[f32] {
        let width = self.shape.pixels();
        &self.pixels[index * width..(index + 1) * width]
    }

    pub fn images(&self) -> impl Iterator<Item = &[f32]> {
        self.pixels.chunks_exact(self.shape.pixels())
    }

    /// Maps the dataset's [-1, 1] convention onto [0, 1].
    pub fn rescale_to_unit(&mut self) {
        for value in &mut self.pixels {
            *value = (*value + 1.0) / 2.0;
        }
    }
}

/// Endless batch source over a dataset.
///
/// Walks the sample order with a cursor and wraps around at the end, so any
/// number of batches can be drawn. With shuffling enabled the order is
/// redrawn at the start of every pass.
#[derive(Debug)]
pub struct BatchProducer<'a> {
    dataset: &'a Dataset,
    batch_size: usize,
    order: Vec<usize>,
    cursor: usize,
    passes: usize,
    rng: Option<Rng>,
}

impl<'a> BatchProducer<'a> {
    pub fn new(dataset: &'a Dataset, batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch_size must be > 0");
        assert!(!dataset.is_empty(), "cannot batch an empty dataset");
        Self {
            dataset,
            batch_size,
            order: (0..dataset.len()).collect(),
            cursor: 0,
            passes: 0,
            rng: None,
        }
    }

    pub fn shuffled(dataset: &'a Dataset, batch_size: usize, seed: u64) -> Self {
        let mut producer = Self::new(dataset, batch_size);
        let mut rng = Rng::new(seed);
        rng.shuffle(&mut producer.order);
        producer.rng = Some(rng);
        producer
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of times the producer has wrapped around the dataset.
    pub fn passes(&self) -> usize {
        self.passes
    }

    pub fn next_batch(&mut self) -> Batch {
        let shape = self.dataset.shape();
        let mut pixels = Vec::with_capacity(self.batch_size * shape.pixels());
        for _ in 0..self.batch_size {
            if self.cursor == self.order.len() {
                self.start_pass();
            }
            pixels.extend_from_slice(self.dataset.image(self.order[self.cursor]));
            self.cursor += 1;
        }
        Batch::from_pixels(shape, pixels)
    }

    fn start_pass(&mut self) {
        self.cursor = 0;
        self.passes += 1;
        if let Some(rng) = self.rng.as_mut() {
            rng.shuffle(&mut self.order);
        }
    }
}

impl Iterator for BatchProducer<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        Some(self.next_batch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `count` images where every value of image `i` equals `i`.
    fn indexed_dataset(count: usize, shape: ImageShape) -> Dataset {
        let images = (0..count)
            .map(|i| vec![i as f32; shape.pixels()])
            .collect::<Vec<_>>();
        Dataset::from_classes(shape, vec![("all".to_string(), images)]).unwrap()
    }

    fn first_values(batch: &Batch) -> Vec<f32> {
        batch.images().map(|image| image[0]).collect()
    }

    #[test]
    fn every_batch_has_batch_size_images_of_full_shape() {
        for (count, batch_size, imsize, channels) in [(5, 2, 3, 1), (7, 7, 2, 3), (3, 8, 4, 4)] {
            let shape = ImageShape::square(imsize, channels);
            let dataset = indexed_dataset(count, shape);
            let mut producer = BatchProducer::new(&dataset, batch_size);
            for batch in producer.by_ref().take(10) {
                assert_eq!(batch.len(), batch_size);
                assert_eq!(batch.shape(), shape);
                assert_eq!(batch.pixels().len(), batch_size * imsize * imsize * channels);
            }
        }
    }

    #[test]
    fn sequential_producer_wraps_around() {
        let shape = ImageShape::square(1, 1);
        let dataset = indexed_dataset(5, shape);
        let mut producer = BatchProducer::new(&dataset, 2);

        assert_eq!(first_values(&producer.next_batch()), vec![0.0, 1.0]);
        assert_eq!(first_values(&producer.next_batch()), vec![2.0, 3.0]);
        assert_eq!(first_values(&producer.next_batch()), vec![4.0, 0.0]);
        assert_eq!(producer.passes(), 1);
    }

    #[test]
    fn batches_do_not_alias_the_dataset() {
        let shape = ImageShape::square(2, 1);
        let dataset = indexed_dataset(2, shape);
        let mut producer = BatchProducer::new(&dataset, 2);

        let mut batch = producer.next_batch();
        batch.rescale_to_unit();

        assert_eq!(dataset.image(1), &[1.0; 4]);
        assert_eq!(batch.image(1), &[1.0; 4]);
        assert_eq!(batch.image(0), &[0.5; 4]);
    }

    #[test]
    fn shuffled_pass_visits_every_sample_once() {
        let shape = ImageShape::square(1, 1);
        let dataset = indexed_dataset(12, shape);
        let mut producer = BatchProducer::shuffled(&dataset, 4, 99);

        for _ in 0..3 {
            let mut seen = (0..3)
                .flat_map(|_| first_values(&producer.next_batch()))
                .collect::<Vec<_>>();
            seen.sort_by(|a, b| a.partial_cmp(b).unwrap());
            assert_eq!(seen, (0..12).map(|i| i as f32).collect::<Vec<_>>());
        }
    }

    #[test]
    fn rescale_maps_signed_range_to_unit() {
        let mut batch = Batch::from_pixels(ImageShape::square(1, 3), vec![-1.0, 0.0, 1.0]);
        batch.rescale_to_unit();
        assert_eq!(batch.pixels(), &[0.0, 0.5, 1.0]);
    }
}
