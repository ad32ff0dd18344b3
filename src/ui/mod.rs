mod console;

pub use console::run;
