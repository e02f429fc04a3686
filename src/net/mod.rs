pub mod addr;
pub mod conn;
pub mod socket;
