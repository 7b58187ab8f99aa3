pub mod attention;
pub mod sparse;
