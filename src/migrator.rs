use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240601_000001_create_carts_table::Migration),
            Box::new(m20240601_000002_create_cart_items_table::Migration),
            Box::new(m20240601_000003_create_cart_abandonment_table::Migration),
        ]
    }
}

mod m20240601_000001_create_carts_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000001_create_carts_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Carts::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Carts::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Carts::UserId).uuid().null())
                        .col(ColumnDef::new(Carts::SessionId).string().null())
                        .col(
                            ColumnDef::new(Carts::Status)
                                .string_len(20)
                                .not_null()
                                .default("active"),
                        )
                        .col(
                            ColumnDef::new(Carts::Currency)
                                .string_len(3)
                                .not_null()
                                .default("USD"),
                        )
                        .col(ColumnDef::new(Carts::ItemCount).integer().not_null().default(0))
                        .col(ColumnDef::new(Carts::VendorCount).integer().not_null().default(0))
                        .col(ColumnDef::new(Carts::Subtotal).decimal().not_null().default(0))
                        .col(ColumnDef::new(Carts::TaxTotal).decimal().not_null().default(0))
                        .col(
                            ColumnDef::new(Carts::ShippingTotal)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Carts::DiscountTotal)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Carts::Total).decimal().not_null().default(0))
                        .col(ColumnDef::new(Carts::ShippingAddress).json().null())
                        .col(ColumnDef::new(Carts::CouponCode).string().null())
                        .col(ColumnDef::new(Carts::ExpiresAt).timestamp_with_time_zone().null())
                        .col(
                            ColumnDef::new(Carts::LastActivityAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Carts::ConvertedOrderId).uuid().null())
                        .col(ColumnDef::new(Carts::Version).integer().not_null().default(1))
                        .col(ColumnDef::new(Carts::CreatedAt).timestamp_with_time_zone().not_null())
                        .col(ColumnDef::new(Carts::UpdatedAt).timestamp_with_time_zone().not_null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_carts_user_status")
                        .table(Carts::Table)
                        .col(Carts::UserId)
                        .col(Carts::Status)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_carts_session_status")
                        .table(Carts::Table)
                        .col(Carts::SessionId)
                        .col(Carts::Status)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_carts_expires_at")
                        .table(Carts::Table)
                        .col(Carts::ExpiresAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Carts::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum Carts {
        Table,
        Id,
        UserId,
        SessionId,
        Status,
        Currency,
        ItemCount,
        VendorCount,
        Subtotal,
        TaxTotal,
        ShippingTotal,
        DiscountTotal,
        Total,
        ShippingAddress,
        CouponCode,
        ExpiresAt,
        LastActivityAt,
        ConvertedOrderId,
        Version,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000002_create_cart_items_table {
    use super::m20240601_000001_create_carts_table::Carts;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000002_create_cart_items_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(CartItems::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(CartItems::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(CartItems::CartId).uuid().not_null())
                        .col(ColumnDef::new(CartItems::ProductId).uuid().not_null())
                        .col(ColumnDef::new(CartItems::VariantId).uuid().null())
                        .col(ColumnDef::new(CartItems::VendorId).uuid().not_null())
                        .col(ColumnDef::new(CartItems::Quantity).integer().not_null())
                        .col(ColumnDef::new(CartItems::UnitPrice).decimal().not_null())
                        .col(ColumnDef::new(CartItems::LineTotal).decimal().not_null())
                        .col(ColumnDef::new(CartItems::Currency).string_len(3).not_null())
                        .col(
                            ColumnDef::new(CartItems::DiscountAmount)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(CartItems::TaxAmount)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(CartItems::ProductName).string().not_null())
                        .col(ColumnDef::new(CartItems::ImageUrl).string().null())
                        .col(ColumnDef::new(CartItems::Category).string().null())
                        .col(
                            ColumnDef::new(CartItems::SavedForLater)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(ColumnDef::new(CartItems::IsGift).boolean().not_null().default(false))
                        .col(ColumnDef::new(CartItems::GiftMessage).string().null())
                        .col(ColumnDef::new(CartItems::InStock).boolean().not_null().default(true))
                        .col(ColumnDef::new(CartItems::StockQuantity).integer().null())
                        .col(ColumnDef::new(CartItems::Position).integer().not_null().default(0))
                        .col(
                            ColumnDef::new(CartItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CartItems::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_cart_items_cart")
                                .from(CartItems::Table, CartItems::CartId)
                                .to(Carts::Table, Carts::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_cart_items_cart_id")
                        .table(CartItems::Table)
                        .col(CartItems::CartId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CartItems::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum CartItems {
        Table,
        Id,
        CartId,
        ProductId,
        VariantId,
        VendorId,
        Quantity,
        UnitPrice,
        LineTotal,
        Currency,
        DiscountAmount,
        TaxAmount,
        ProductName,
        ImageUrl,
        Category,
        SavedForLater,
        IsGift,
        GiftMessage,
        InStock,
        StockQuantity,
        Position,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000003_create_cart_abandonment_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000003_create_cart_abandonment_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            // no FK to carts: tracking rows outlive merged guest carts
            manager
                .create_table(
                    Table::create()
                        .table(CartAbandonmentTracking::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(CartAbandonmentTracking::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(CartAbandonmentTracking::CartId).uuid().not_null())
                        .col(
                            ColumnDef::new(CartAbandonmentTracking::Stage)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(ColumnDef::new(CartAbandonmentTracking::LastPage).string().null())
                        .col(
                            ColumnDef::new(CartAbandonmentTracking::CartValue)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(CartAbandonmentTracking::AbandonedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CartAbandonmentTracking::EmailsSent)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(CartAbandonmentTracking::Clicks)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(CartAbandonmentTracking::LastEmailAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(CartAbandonmentTracking::Recovered)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(CartAbandonmentTracking::RecoveredAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(CartAbandonmentTracking::RecoveredOrderId)
                                .uuid()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(CartAbandonmentTracking::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CartAbandonmentTracking::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("uq_cart_abandonment_cart_id")
                        .table(CartAbandonmentTracking::Table)
                        .col(CartAbandonmentTracking::CartId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_cart_abandonment_recovered_at")
                        .table(CartAbandonmentTracking::Table)
                        .col(CartAbandonmentTracking::Recovered)
                        .col(CartAbandonmentTracking::AbandonedAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(
                    Table::drop()
                        .table(CartAbandonmentTracking::Table)
                        .to_owned(),
                )
                .await
        }
    }

    #[derive(DeriveIden)]
    enum CartAbandonmentTracking {
        Table,
        Id,
        CartId,
        Stage,
        LastPage,
        CartValue,
        AbandonedAt,
        EmailsSent,
        Clicks,
        LastEmailAt,
        Recovered,
        RecoveredAt,
        RecoveredOrderId,
        CreatedAt,
        UpdatedAt,
    }
}
