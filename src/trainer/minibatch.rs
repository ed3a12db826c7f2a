//! Minibatch data sources: named, typed streams of samples pulled by the
//! training loop.

use std::collections::HashMap;

use crate::{
    shape::Shape,
    value::{DataType, StorageKind, Value},
};

#[derive(Clone, Debug)]
pub struct StreamDescription {
    pub name: String,
    pub id: usize,
    pub storage: StorageKind,
    pub dtype: DataType,
    pub sample_shape: Shape,
}

/// A source of minibatches across named streams. The actual size of a
/// returned minibatch is the minimum across all requested streams;
/// `None` signals exhaustion.
pub trait MinibatchSource {
    fn stream_descriptions(&self) -> Vec<StreamDescription>;

    fn next_minibatch(&mut self, requested_sizes: &HashMap<String, usize>) -> Option<HashMap<String, Value>>;

    /// Repositions the source on its global sample timeline.
    fn reset_position(&mut self, position: usize);
}

/// Looks up the stream with the given name.
pub fn stream_description(source: &dyn MinibatchSource, name: &str) -> Option<StreamDescription> {
    source.stream_descriptions().into_iter().find(|s| s.name == name)
}

struct InMemoryStream {
    description: StreamDescription,
    samples: Vec<f32>,
}

/// A minibatch source over in-memory dense samples, one flattened buffer
/// per stream. All streams must hold the same number of samples.
pub struct InMemorySource {
    streams: Vec<InMemoryStream>,
    num_samples: usize,
    cursor: usize,
    device: crate::device::DeviceDescriptor,
}

impl InMemorySource {
    pub fn new(
        streams: Vec<(String, Shape, Vec<f32>)>,
        device: crate::device::DeviceDescriptor,
    ) -> Self {
        assert!(!streams.is_empty(), "InMemorySource needs at least one stream!");

        let mut built = Vec::new();
        let mut num_samples = None;

        for (id, (name, sample_shape, samples)) in streams.into_iter().enumerate() {
            let size = sample_shape.size();
            assert_eq!(samples.len() % size, 0, "Stream '{name}' data is not a whole number of samples!");

            let count = samples.len() / size;
            match num_samples {
                None => num_samples = Some(count),
                Some(n) => assert_eq!(n, count, "Stream '{name}' sample count differs from its peers!"),
            }

            built.push(InMemoryStream {
                description: StreamDescription {
                    name,
                    id,
                    storage: StorageKind::Dense,
                    dtype: DataType::F32,
                    sample_shape,
                },
                samples,
            });
        }

        Self { streams: built, num_samples: num_samples.unwrap(), cursor: 0, device }
    }
}

impl MinibatchSource for InMemorySource {
    fn stream_descriptions(&self) -> Vec<StreamDescription> {
        self.streams.iter().map(|s| s.description.clone()).collect()
    }

    fn next_minibatch(&mut self, requested_sizes: &HashMap<String, usize>) -> Option<HashMap<String, Value>> {
        if self.cursor >= self.num_samples {
            return None;
        }

        let requested = self
            .streams
            .iter()
            .filter_map(|s| requested_sizes.get(&s.description.name))
            .copied()
            .min()?;

        let take = requested.min(self.num_samples - self.cursor);
        if take == 0 {
            return None;
        }

        let mut out = HashMap::new();
        for stream in &self.streams {
            let size = stream.description.sample_shape.size();
            let slice = &stream.samples[self.cursor * size..(self.cursor + take) * size];
            let value = Value::from_slice(stream.description.sample_shape.clone(), Some(take), slice, self.device)
                .expect("stream sample sizes are validated on construction");
            out.insert(stream.description.name.clone(), value);
        }

        self.cursor += take;

        Some(out)
    }

    fn reset_position(&mut self, position: usize) {
        self.cursor = position.min(self.num_samples);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceDescriptor;

    fn source() -> InMemorySource {
        InMemorySource::new(
            vec![
                ("features".to_string(), Shape::from([2]), (0..12).map(|x| x as f32).collect()),
                ("labels".to_string(), Shape::from([1]), (0..6).map(|x| x as f32).collect()),
            ],
            DeviceDescriptor::Cpu,
        )
    }

    #[test]
    fn batch_size_is_min_across_streams() {
        let mut src = source();
        let mut sizes = HashMap::new();
        sizes.insert("features".to_string(), 4);
        sizes.insert("labels".to_string(), 2);

        let batch = src.next_minibatch(&sizes).unwrap();
        assert_eq!(batch["features"].batch_size(), Some(2));
        assert_eq!(batch["labels"].batch_size(), Some(2));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut src = source();
        let mut sizes = HashMap::new();
        sizes.insert("features".to_string(), 4);
        sizes.insert("labels".to_string(), 4);

        assert!(src.next_minibatch(&sizes).is_some());
        let last = src.next_minibatch(&sizes).unwrap();
        assert_eq!(last["features"].batch_size(), Some(2));
        assert!(src.next_minibatch(&sizes).is_none());

        src.reset_position(0);
        assert!(src.next_minibatch(&sizes).is_some());
    }

    #[test]
    fn stream_lookup() {
        let src = source();
        let desc = stream_description(&src, "labels").unwrap();
        assert_eq!(desc.sample_shape, Shape::from([1]));
        assert!(stream_description(&src, "missing").is_none());
    }
}
