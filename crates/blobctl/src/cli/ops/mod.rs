mod add;
mod cat;
mod status;

pub use add::Add;
pub use cat::Cat;
pub use status::Status;
