diesel::table! {
    bookings (id) {
        id -> Uuid,
        user_id -> Uuid,
        user_email -> Varchar,
        event_id -> Uuid,
        ticket_type_id -> Uuid,
        quantity -> Int4,
        amount -> Numeric,
        currency -> Varchar,
        status -> Varchar,
        payment_status -> Varchar,
        payment_intent_id -> Nullable<Varchar>,
        cancellation_reason -> Nullable<Varchar>,
        expires_at -> Timestamptz,
        confirmed_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    outbox_events (id) {
        id -> Uuid,
        aggregate_type -> Varchar,
        aggregate_id -> Uuid,
        event_type -> Varchar,
        payload -> Jsonb,
        status -> Varchar,
        created_at -> Timestamptz,
        dispatched_at -> Nullable<Timestamptz>,
        published_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    reservations (booking_id) {
        booking_id -> Uuid,
        ticket_type_id -> Uuid,
        quantity -> Int4,
        status -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    ticket_types (id) {
        id -> Uuid,
        event_id -> Uuid,
        name -> Varchar,
        total_quantity -> Int4,
        available_quantity -> Int4,
        reserved_quantity -> Int4,
        sold_quantity -> Int4,
        price -> Numeric,
        currency -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    bookings,
    outbox_events,
    reservations,
    ticket_types,
);
