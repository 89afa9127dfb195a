pub mod fits;
pub mod followup;
pub mod gcn;
pub mod healpix;
pub mod macros;
pub mod skymap;
pub mod user;
pub mod voevent;

pub use followup::*;
pub use gcn::*;
pub use skymap::{Skymap, SkymapError, SkymapSource};
pub use user::Principal;
pub use voevent::{VoEvent, VoEventError};
