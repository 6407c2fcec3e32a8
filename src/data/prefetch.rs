//! Bounded batch prefetching.
//!
//! One producer thread walks a `BatchSource` in index order and feeds a
//! bounded channel; the training thread blocks on `next`. Assembly and
//! decode overlap with compute, but order is fixed by the source, so
//! prefetching never affects what the optimizer sees. Dropping the loader
//! disconnects the channel and the producer exits on its next send.

use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::{BatchSource, ImageBatch, LabelBatch};

/// Decoupled batch producer for one epoch.
pub struct PrefetchLoader {
    rx: Receiver<anyhow::Result<(ImageBatch, LabelBatch)>>,

    // Detached on drop; the closed channel stops it.
    _handle: JoinHandle<()>,
}

impl PrefetchLoader {
    pub fn new(source: Arc<dyn BatchSource>, epoch: usize, depth: usize) -> Self {
        let (tx, rx) = sync_channel(depth.max(1));
        let handle = std::thread::spawn(move || {
            for index in 0..source.num_batches() {
                if tx.send(source.batch(epoch, index)).is_err() {
                    break;
                }
            }
        });
        Self {
            rx,
            _handle: handle,
        }
    }

    /// Next batch, or `None` once the epoch is exhausted.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<anyhow::Result<(ImageBatch, LabelBatch)>> {
        self.rx.recv().ok()
    }
}
