use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use bigdecimal::BigDecimal;
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use shared::models::{Booking, BookingStatus, CancelReason, NewBooking, PaymentStatus};
use shared::{metrics, BookingStore, InventoryStore};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub bookings: Arc<dyn BookingStore>,
    pub inventory: Arc<dyn InventoryStore>,
    pub booking_ttl: chrono::Duration,
    pub metrics: PrometheusHandle,
}

#[derive(Debug, Deserialize)]
pub struct CreateBookingRequest {
    pub user_id: Uuid,
    pub user_email: String,
    pub ticket_type_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BookingResponse {
    pub id: Uuid,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub quantity: i32,
    pub amount: BigDecimal,
    pub currency: String,
    pub cancellation_reason: Option<CancelReason>,
    pub expires_at: chrono::DateTime<Utc>,
    pub confirmed_at: Option<chrono::DateTime<Utc>>,
}

impl From<Booking> for BookingResponse {
    fn from(b: Booking) -> Self {
        Self {
            id: b.id,
            status: b.status,
            payment_status: b.payment_status,
            quantity: b.quantity,
            amount: b.amount,
            currency: b.currency,
            cancellation_reason: b.cancellation_reason,
            expires_at: b.expires_at,
            confirmed_at: b.confirmed_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse { error: error.into() }))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/bookings", post(create_booking))
        .route("/bookings/:id", get(get_booking))
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

/// Commits a PENDING booking together with its `booking.created` event.
pub async fn create_booking(
    State(state): State<AppState>,
    Json(request): Json<CreateBookingRequest>,
) -> Result<(StatusCode, Json<BookingResponse>), ApiError> {
    if request.quantity <= 0 {
        return Err(api_error(StatusCode::UNPROCESSABLE_ENTITY, "quantity must be positive"));
    }
    let tickets = state
        .inventory
        .find_ticket_type(request.ticket_type_id)
        .await
        .map_err(|e| {
            tracing::error!("Failed to load ticket type: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to load ticket type")
        })?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "ticket type not found"))?;

    let booking = NewBooking {
        user_id: request.user_id,
        user_email: request.user_email,
        event_id: tickets.event_id,
        ticket_type_id: tickets.id,
        quantity: request.quantity,
        amount: &tickets.price * BigDecimal::from(request.quantity),
        currency: tickets.currency,
        expires_at: Utc::now() + state.booking_ttl,
    };

    match state.bookings.create_booking(booking).await {
        Ok(booking) => {
            metrics::record_booking_created();
            tracing::info!(booking_id = %booking.id, quantity = booking.quantity, "booking created");
            Ok((StatusCode::ACCEPTED, Json(booking.into())))
        }
        Err(e) => {
            tracing::error!("Failed to create booking: {}", e);
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to create booking: {}", e),
            ))
        }
    }
}

pub async fn get_booking(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BookingResponse>, ApiError> {
    match state.bookings.find_booking(id).await {
        Ok(Some(booking)) => Ok(Json(booking.into())),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, "booking not found")),
        Err(e) => {
            tracing::error!("Failed to load booking {}: {}", id, e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to load booking"))
        }
    }
}

pub async fn render_metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}

pub async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use shared::models::NewTicketType;
    use shared::store::MemoryStore;
    use shared::EventKind;
    use tower::ServiceExt;

    async fn app() -> (Router, MemoryStore, Uuid) {
        let store = MemoryStore::new();
        let tickets = store
            .create_ticket_type(NewTicketType {
                event_id: Uuid::new_v4(),
                name: "Floor".to_string(),
                total_quantity: 100,
                price: BigDecimal::from(30),
                currency: "USD".to_string(),
            })
            .await
            .unwrap();
        let state = AppState {
            bookings: Arc::new(store.clone()),
            inventory: Arc::new(store.clone()),
            booking_ttl: chrono::Duration::minutes(15),
            metrics: PrometheusBuilder::new().build_recorder().handle(),
        };
        (create_router(state), store, tickets.id)
    }

    fn post_booking(ticket_type_id: Uuid, quantity: i32) -> Request<Body> {
        let body = serde_json::json!({
            "user_id": Uuid::new_v4(),
            "user_email": "fan@example.com",
            "ticket_type_id": ticket_type_id,
            "quantity": quantity,
        });
        Request::post("/bookings")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn created_booking_is_pending_and_announced() {
        let (app, store, ticket_type_id) = app().await;

        let response = app.clone().oneshot(post_booking(ticket_type_id, 3)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let created: BookingResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(created.status, BookingStatus::Pending);
        assert_eq!(created.amount, BigDecimal::from(90));
        assert_eq!(store.events_of(EventKind::BookingCreated).await.len(), 1);

        let response = app
            .oneshot(
                Request::get(format!("/bookings/{}", created.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_ticket_type_and_booking_are_not_found() {
        let (app, store, _) = app().await;

        let response = app.clone().oneshot(post_booking(Uuid::new_v4(), 1)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(store.outbox().await.is_empty());

        let response = app
            .oneshot(
                Request::get(format!("/bookings/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn non_positive_quantity_is_rejected() {
        let (app, _, ticket_type_id) = app().await;
        let response = app.oneshot(post_booking(ticket_type_id, 0)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
