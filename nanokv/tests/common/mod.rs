pub mod mock_flash;

pub use mock_flash::{MockFlash, TestFlash};
