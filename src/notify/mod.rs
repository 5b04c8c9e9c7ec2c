//! Terminal output for scan reports and stored records.

pub mod console;

pub use console::ConsoleOutput;
