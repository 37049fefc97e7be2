//! tc-seeker: an exam-slot seeker and transfer orchestrator.
//!
//! The crate watches one booking page (the *seeker* page) for slots that
//! match the operator's date and time preferences, reserves the best
//! match, and asks the operator over a messaging channel which *target*
//! page the reservation should be moved to. The move follows a
//! claim-before-release protocol: the target slot is reserved before the
//! seeker hold is given up, so the operator never ends up with nothing.
//!
//! The core is transport-agnostic. [`SlotSource`], [`ReservationAgent`]
//! and [`ResponseChannel`] are the seams; [`moodle`] and [`telegram`]
//! provide the production implementations, and tests script the seams
//! directly.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tc_seeker::{
//!     MoodleClient, MoodleReservationAgent, MoodleSlotSource, SeekerOrchestrator, Settings,
//!     TelegramChannel,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::from_file("config.toml")?;
//! let client = Arc::new(MoodleClient::new(&settings.moodle)?);
//! client.login().await?;
//!
//! let mut orchestrator = SeekerOrchestrator::new(
//!     &settings,
//!     Arc::new(MoodleSlotSource::new(client.clone())),
//!     Arc::new(MoodleReservationAgent::new(client)),
//!     Arc::new(TelegramChannel::connect(&settings.telegram)?),
//! );
//! orchestrator.run().await;
//! # Ok(())
//! # }
//! ```

pub mod booking;
pub mod channel;
pub mod config;
pub mod error;
pub mod filter;
pub mod moodle;
pub mod orchestrator;
pub mod retry;
pub mod slot;
pub mod source;
pub mod telegram;
pub mod transfer;

pub use booking::{ReservationAgent, ReservedHold};
pub use channel::{parse_target_choice, ConversationId, ResponseChannel};
pub use config::{Settings, SettingsBuilder};
pub use error::{Result, SeekerError};
pub use filter::{select, PreferenceWindow, SeenSlotMemory};
pub use moodle::{MoodleClient, MoodleReservationAgent, MoodleSlotSource};
pub use orchestrator::{Phase, RunEnd, SeekerOrchestrator};
pub use retry::{retry_async, RetryPolicy};
pub use slot::{HoldEpoch, HoldRecord, PageRef, Slot, SlotKey, TargetDescriptor};
pub use source::{SlotSnapshot, SlotSource};
pub use telegram::TelegramChannel;
pub use transfer::{PartialStage, TransferCoordinator, TransferOutcome};
