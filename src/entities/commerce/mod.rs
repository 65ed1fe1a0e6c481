/// Cart subsystem entities
pub mod cart;
pub mod cart_abandonment;
pub mod cart_item;

// Re-export entities
pub use cart::{CartStatus, Entity as Cart, Model as CartModel, ShippingAddress};
pub use cart_abandonment::{AbandonmentStage, Entity as CartAbandonment, Model as CartAbandonmentModel};
pub use cart_item::{Entity as CartItem, Model as CartItemModel};
