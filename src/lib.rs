pub mod app;
pub mod bus;
pub mod config;
pub mod coordination;
pub mod db;
pub mod error;
pub mod lock;
pub mod logging;
pub mod models;
pub mod recorder;
pub mod stream;
pub mod tally;
pub mod tasks;

pub use app::{App, AppError};
pub use bus::{EventBus, Subscription};
pub use config::Settings;
pub use error::VoteError;
pub use lock::{BallotLock, BallotLockGuard};
pub use models::{Ballot, BallotDraft, BallotStatus, OptionSelector, TallySnapshot};
pub use recorder::VoteRecorder;
pub use stream::{LiveEvent, LiveUpdateStream};
pub use tasks::reaper::{StaleMetadataReaper, SweepReport};
