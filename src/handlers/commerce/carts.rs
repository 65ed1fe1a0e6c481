use crate::handlers::common::{
    created_response, map_service_error, success_response, validate_input,
};
use crate::{
    entities::commerce::ShippingAddress,
    errors::ApiError,
    services::commerce::cart_service::{AddItemInput, CartOwner, UpdateItemInput},
    ApiResponse, AppState,
};
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

/// Creates the router for cart endpoints
pub fn carts_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(get_or_create_cart))
        .route("/:id", get(get_cart))
        .route("/:id/summary", get(get_summary))
        .route("/:id/items", post(add_item))
        .route(
            "/:id/items/:product_id",
            put(update_item).delete(remove_item),
        )
        .route("/:id/items/:product_id/save-for-later", post(save_for_later))
        .route("/:id/items/:product_id/move-to-cart", post(move_to_cart))
        .route("/:id/saved-items", get(list_saved_items))
        .route("/:id/clear", post(clear_cart))
        .route("/:id/merge", post(merge_carts))
        .route("/:id/coupon", post(apply_coupon).delete(remove_coupon))
        .route("/:id/shipping-address", put(set_shipping_address))
        .route("/:id/validate", post(validate_cart))
        .route("/:id/convert", post(convert_cart))
}

/// Creates the router for operator maintenance endpoints
pub fn maintenance_routes() -> Router<Arc<AppState>> {
    Router::new().route("/expired-carts", post(cleanup_expired_carts))
}

/// Find the owner's active cart or create one
async fn get_or_create_cart(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateCartRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let owner = CartOwner {
        user_id: payload.user_id,
        session_id: payload.session_id,
    };
    let (cart, created) = state
        .services
        .carts
        .get_or_create(owner, payload.currency)
        .await
        .map_err(map_service_error)?;

    Ok(if created {
        created_response(cart)
    } else {
        success_response(cart)
    })
}

/// Get cart with items
async fn get_cart(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .services
        .carts
        .get_cart(id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

async fn get_summary(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let summary = state
        .services
        .carts
        .get_summary(id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(summary))
}

/// Add item to cart
async fn add_item(
    State(state): State<Arc<AppState>>,
    Path(cart_id): Path<Uuid>,
    Json(payload): Json<AddItemInput>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let cart = state
        .services
        .carts
        .add_item(cart_id, payload)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

/// Update quantity or gift fields of a line; quantity 0 removes it
async fn update_item(
    State(state): State<Arc<AppState>>,
    Path((cart_id, product_id)): Path<(Uuid, Uuid)>,
    Query(line): Query<LineQuery>,
    Json(payload): Json<UpdateItemInput>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let cart = state
        .services
        .carts
        .update_item(cart_id, product_id, line.variant_id, payload)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

async fn remove_item(
    State(state): State<Arc<AppState>>,
    Path((cart_id, product_id)): Path<(Uuid, Uuid)>,
    Query(line): Query<LineQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .services
        .carts
        .remove_item(cart_id, product_id, line.variant_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

async fn save_for_later(
    State(state): State<Arc<AppState>>,
    Path((cart_id, product_id)): Path<(Uuid, Uuid)>,
    Query(line): Query<LineQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .services
        .carts
        .save_for_later(cart_id, product_id, line.variant_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

async fn move_to_cart(
    State(state): State<Arc<AppState>>,
    Path((cart_id, product_id)): Path<(Uuid, Uuid)>,
    Query(line): Query<LineQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .services
        .carts
        .move_to_cart(cart_id, product_id, line.variant_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

async fn list_saved_items(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let items = state
        .services
        .carts
        .list_saved_items(id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(items))
}

/// Clear all items from cart
async fn clear_cart(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .services
        .carts
        .clear_cart(id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

/// Merge a guest cart into the cart in the path
async fn merge_carts(
    State(state): State<Arc<AppState>>,
    Path(target_id): Path<Uuid>,
    Json(payload): Json<MergeCartsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .services
        .carts
        .merge_carts(target_id, payload.guest_cart_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

async fn apply_coupon(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ApplyCouponRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let cart = state
        .services
        .carts
        .apply_coupon(id, &payload.code)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

async fn remove_coupon(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .services
        .carts
        .remove_coupon(id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

async fn set_shipping_address(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ShippingAddressRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let cart = state
        .services
        .carts
        .set_shipping_address(id, payload.into())
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

/// Checkout readiness: 200 when valid, 400 carrying the report otherwise
async fn validate_cart(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state
        .services
        .validation
        .validate_cart(id)
        .await
        .map_err(map_service_error)?;

    if report.is_valid {
        return Ok(success_response(report));
    }

    let errors = report.errors().map(|issue| issue.message.clone()).collect();
    let body = ApiResponse::rejected(report, "Cart is not ready for checkout", errors);
    Ok((StatusCode::BAD_REQUEST, Json(body)).into_response())
}

async fn convert_cart(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ConvertCartRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .services
        .carts
        .convert_to_order(id, payload.order_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

/// Run the guest-cart expiry sweep now
async fn cleanup_expired_carts(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let expired = state
        .services
        .carts
        .cleanup_expired_carts(Utc::now())
        .await
        .map_err(map_service_error)?;

    Ok(success_response(serde_json::json!({ "expired": expired })))
}

// Request DTOs

#[derive(Debug, Deserialize, Validate)]
pub struct CreateCartRequest {
    pub user_id: Option<Uuid>,
    #[validate(length(min = 1, max = 128))]
    pub session_id: Option<String>,
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
}

/// Selects the variant of a line; absent means the base product
#[derive(Debug, Default, Deserialize)]
pub struct LineQuery {
    pub variant_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct MergeCartsRequest {
    pub guest_cart_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ApplyCouponRequest {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ShippingAddressRequest {
    #[validate(length(min = 1, max = 255))]
    pub line1: String,
    #[validate(length(max = 255))]
    pub line2: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    #[validate(length(max = 100))]
    pub region: Option<String>,
    #[validate(length(min = 1, max = 20))]
    pub postal_code: String,
    #[validate(length(equal = 2))]
    pub country: String,
}

impl From<ShippingAddressRequest> for ShippingAddress {
    fn from(req: ShippingAddressRequest) -> Self {
        ShippingAddress {
            line1: req.line1,
            line2: req.line2,
            city: req.city,
            region: req.region,
            postal_code: req.postal_code,
            country: req.country,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConvertCartRequest {
    pub order_id: Uuid,
}
