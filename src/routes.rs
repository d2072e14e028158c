use std::{sync::Arc, time::Duration};

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use http::{header::CONTENT_TYPE, HeaderName, Method};
use tower_http::cors::{Any, CorsLayer};

use crate::{
    handlers::{self, MOD_KEY_HEADER},
    state::AppState,
    storage::Store,
};

pub fn create_routes<S: Store>(state: Arc<AppState<S>>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([CONTENT_TYPE, HeaderName::from_static(MOD_KEY_HEADER)])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .nest("/api", api_routes::<S>())
        .layer(cors)
        .with_state(state)
}

fn api_routes<S: Store>() -> Router<Arc<AppState<S>>> {
    Router::new()
        .route("/lectures", post(handlers::create_lecture::<S>))
        .route(
            "/lectures/{id}",
            get(handlers::get_lecture::<S>).delete(handlers::delete_lecture::<S>),
        )
        .route(
            "/lectures/{id}/moderator",
            get(handlers::check_moderator::<S>),
        )
        .route("/lectures/{id}/close", post(handlers::close_lecture::<S>))
        .route(
            "/lectures/{id}/pause",
            post(handlers::toggle_lecture_pause::<S>),
        )
        .route(
            "/lectures/{id}/frequency",
            put(handlers::set_frequency::<S>),
        )
        .route(
            "/lectures/{id}/speed",
            post(handlers::cast_speed_vote::<S>).delete(handlers::reset_speed_votes::<S>),
        )
        .route("/lectures/{id}/users", post(handlers::register_user::<S>))
        .route(
            "/lectures/{id}/users/{user_id}/ban",
            post(handlers::ban_user::<S>).delete(handlers::unban_user::<S>),
        )
        .route(
            "/lectures/{id}/questions",
            get(handlers::list_questions::<S>).post(handlers::ask_question::<S>),
        )
        .route("/lectures/{id}/polls", post(handlers::create_poll::<S>))
        .route(
            "/lectures/{id}/poll",
            get(handlers::fetch_poll_for_student::<S>),
        )
        .route(
            "/lectures/{id}/poll/moderator",
            get(handlers::fetch_poll_for_moderator::<S>),
        )
        .route("/questions/{id}", delete(handlers::delete_question::<S>))
        .route(
            "/questions/{id}/upvote",
            post(handlers::upvote_question::<S>),
        )
        .route(
            "/questions/{id}/answering",
            post(handlers::begin_answering::<S>).delete(handlers::cancel_answering::<S>),
        )
        .route("/questions/{id}/answer", post(handlers::submit_answer::<S>))
        .route(
            "/questions/{id}/editing",
            post(handlers::begin_editing::<S>).delete(handlers::cancel_editing::<S>),
        )
        .route("/questions/{id}/text", put(handlers::submit_edit::<S>))
        .route("/polls/{id}/options", post(handlers::add_option::<S>))
        .route("/polls/{id}/toggle", post(handlers::toggle_poll::<S>))
        .route("/polls/{id}/votes", delete(handlers::reset_poll_votes::<S>))
        .route("/options/{id}/votes", post(handlers::cast_poll_vote::<S>))
        .route("/users/{id}/votes", get(handlers::list_user_votes::<S>))
}
