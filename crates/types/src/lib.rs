//! Shared data model for the PiedPiper file host.
//!
//! Every persisted entity (users, objects, upload sessions, tokens) lives here
//! together with the fixed-width timestamp format, the injectable clock and the
//! error taxonomy that every service crate maps its failures onto.

pub mod clock;
pub mod error;
pub mod object;
pub mod random;
pub mod timestamp;
pub mod token;
pub mod user;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::ErrorKind;
pub use object::{Object, ObjectId, UploadId, UploadSession};
pub use random::{random_alphanumeric, ALPHANUMERIC};
pub use timestamp::{Timestamp, TimestampError, TIMESTAMP_FORMAT};
pub use token::{Token, TokenId, TokenIdError, TokenResponse, TOKEN_ID_BYTES};
pub use user::User;
