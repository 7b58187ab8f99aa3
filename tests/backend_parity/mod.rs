pub mod helpers;

pub mod attention;
pub mod sparse;
