// ObjectStore - per-key local object persistence with debounced atomic writes

pub mod atomic;
pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod handle;
pub mod notify;
pub mod queue;
pub mod store;

// Re-export main types for convenience
pub use codec::{Codec, CodecError, JsonCodec};
pub use config::Config;
pub use error::{StoreError, StoreResult};
pub use handle::StoreHandle;
pub use notify::{ChannelNotifier, InlineNotifier, Notifier, NotifyPump};
pub use queue::{QueueConfig, Task, TaskKind, TaskQueue};
pub use store::{ObjectStore, ReadFuture, StoreBuilder};
