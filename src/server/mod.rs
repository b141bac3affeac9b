pub mod router;

pub use router::{DeskState, desk_router};
