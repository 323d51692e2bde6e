pub mod genet;
pub mod project;
pub mod table;
pub mod union_find;
