pub mod procedure;
pub mod similarity;
