use crate::{multiplexer::Handler, sample::Sample};
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// Samples of a run held in memory so they can be read while the run is still going.
#[derive(Debug, Clone, Default)]
pub struct SampleBuffer {
    samples: Arc<RwLock<Vec<Sample>>>,
}
impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, sample: Sample) {
        self.samples
            .write()
            .expect("sample buffer lock poisoned")
            .push(sample);
    }

    pub fn snapshot(&self) -> Vec<Sample> {
        self.samples
            .read()
            .expect("sample buffer lock poisoned")
            .clone()
    }

    pub fn len(&self) -> usize {
        self.samples.read().expect("sample buffer lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct BufferHandler {
    buffer: SampleBuffer,
}
impl BufferHandler {
    pub fn new(buffer: SampleBuffer) -> Self {
        BufferHandler { buffer }
    }
}

#[async_trait]
impl Handler for BufferHandler {
    fn name(&self) -> &str {
        "buffer"
    }

    async fn handle(self: Box<Self>, mut samples: mpsc::Receiver<Sample>) -> anyhow::Result<()> {
        while let Some(sample) = samples.recv().await {
            self.buffer.push(sample);
        }
        Ok(())
    }
}
