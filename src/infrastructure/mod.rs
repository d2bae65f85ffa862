pub mod bus;
pub mod scanner;
pub mod storage;
