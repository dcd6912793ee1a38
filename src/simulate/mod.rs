pub mod coalescent;
pub mod driver;
pub mod io;
pub mod types;

pub use driver::fill_counts;
pub use types::Database;
