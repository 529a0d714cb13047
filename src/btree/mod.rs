pub mod catalog;
pub mod cursor;
pub mod key;
pub mod node;
pub mod tree;
