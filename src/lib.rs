pub mod cli;
pub mod kelpie;
