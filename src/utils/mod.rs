pub mod enums;
pub mod io;
pub mod o11y;
pub mod testing;
