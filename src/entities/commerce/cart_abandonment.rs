use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Abandonment tracking row; at most one per cart.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "cart_abandonment_tracking")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub cart_id: Uuid,
    pub stage: AbandonmentStage,
    #[sea_orm(nullable)]
    pub last_page: Option<String>,
    /// Cart total at the most recent signal
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub cart_value: Decimal,
    pub abandoned_at: DateTime<Utc>,
    pub emails_sent: i32,
    pub clicks: i32,
    #[sea_orm(nullable)]
    pub last_email_at: Option<DateTime<Utc>>,
    pub recovered: bool,
    #[sea_orm(nullable)]
    pub recovered_at: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub recovered_order_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::cart::Entity",
        from = "Column::CartId",
        to = "super::cart::Column::Id"
    )]
    Cart,
}

impl Related<super::cart::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Cart.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Checkout phase at which the cart was last seen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum AbandonmentStage {
    #[sea_orm(string_value = "cart")]
    Cart,
    #[sea_orm(string_value = "checkout")]
    Checkout,
    #[sea_orm(string_value = "payment")]
    Payment,
}

impl AbandonmentStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbandonmentStage::Cart => "cart",
            AbandonmentStage::Checkout => "checkout",
            AbandonmentStage::Payment => "payment",
        }
    }
}
