mod device;
mod model;
mod state;
mod user;

pub use device::*;
pub use model::*;
pub use state::*;
pub use user::*;
