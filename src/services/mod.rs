// Commerce and cart lifecycle
pub mod commerce;
