pub mod https;
pub mod unix;
