//! Axum handlers, one per core operation.
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    lecture::SpeedVote,
    models::{
        AskRequest, CreateLectureRequest, CreatedLecture, FrequencyRequest, Lecture, OptionRequest,
        Poll, PollOption, PollView, Question, RegisterRequest, SpeedVoteRequest, TextRequest,
        User, UserRequest, VoteRecord,
    },
    poll::PollVote,
    question::{Handling, ListedQuestion, Upvote},
    state::AppState,
    storage::Store,
};

/// Header carrying the moderator key.
pub const MOD_KEY_HEADER: &str = "x-mod-key";

type AppStateRef<S> = State<Arc<AppState<S>>>;

fn mod_key(headers: &HeaderMap) -> Option<&str> {
    headers.get(MOD_KEY_HEADER).and_then(|value| value.to_str().ok())
}

/// A missing header counts as an empty key, so unknown lectures still
/// answer 404 before the key is looked at.
fn presented_key(headers: &HeaderMap) -> &str {
    mod_key(headers).unwrap_or_default()
}

/// Open a lecture; the response is the only time the moderator key is sent
pub async fn create_lecture<S: Store>(
    State(state): AppStateRef<S>,
    Json(req): Json<CreateLectureRequest>,
) -> Result<(StatusCode, Json<CreatedLecture>)> {
    let lecture = state
        .create_lecture(&req.name, &req.creator_name, req.start_time, req.frequency)
        .await?;
    let mod_key = lecture.mod_key;

    Ok((StatusCode::CREATED, Json(CreatedLecture { lecture, mod_key })))
}

pub async fn get_lecture<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<Uuid>,
) -> Result<Json<Lecture>> {
    Ok(Json(state.get_lecture(id).await?))
}

pub async fn delete_lecture<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    state.delete_lecture(id, presented_key(&headers)).await?;
    Ok(Json(json!({ "status": "Lecture deleted" })))
}

pub async fn check_moderator<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    state.check_moderator(id, presented_key(&headers)).await?;
    Ok(Json(json!({ "status": "Moderator key accepted" })))
}

pub async fn close_lecture<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Lecture>> {
    Ok(Json(state.close_lecture(id, presented_key(&headers)).await?))
}

pub async fn toggle_lecture_pause<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Lecture>> {
    Ok(Json(
        state.toggle_lecture_pause(id, presented_key(&headers)).await?,
    ))
}

pub async fn set_frequency<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<FrequencyRequest>,
) -> Result<Json<Lecture>> {
    Ok(Json(
        state
            .set_frequency(id, presented_key(&headers), req.seconds)
            .await?,
    ))
}

pub async fn cast_speed_vote<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<Uuid>,
    Json(req): Json<SpeedVoteRequest>,
) -> Result<Json<SpeedVote>> {
    Ok(Json(
        state
            .cast_lecture_speed_vote(req.user_id, id, &req.choice)
            .await?,
    ))
}

pub async fn reset_speed_votes<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Lecture>> {
    Ok(Json(
        state.reset_speed_votes(id, presented_key(&headers)).await?,
    ))
}

pub async fn register_user<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<Uuid>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<User>)> {
    let user = state
        .register_user(id, req.id, &req.name, &req.fingerprint)
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn ban_user<S: Store>(
    State(state): AppStateRef<S>,
    Path((id, user_id)): Path<(Uuid, i64)>,
    headers: HeaderMap,
) -> Result<Json<User>> {
    Ok(Json(
        state.ban_user(id, presented_key(&headers), user_id).await?,
    ))
}

pub async fn unban_user<S: Store>(
    State(state): AppStateRef<S>,
    Path((id, user_id)): Path<(Uuid, i64)>,
    headers: HeaderMap,
) -> Result<Json<User>> {
    Ok(Json(
        state.unban_user(id, presented_key(&headers), user_id).await?,
    ))
}

pub async fn list_user_votes<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<VoteRecord>>> {
    Ok(Json(state.list_user_votes(id).await?))
}

#[derive(Deserialize)]
pub struct OwnerQuery {
    pub user_id: Option<i64>,
}

pub async fn list_questions<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<Uuid>,
    Query(viewer): Query<OwnerQuery>,
) -> Result<Json<Vec<ListedQuestion>>> {
    Ok(Json(state.list_questions_for(id, viewer.user_id).await?))
}

pub async fn ask_question<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<Uuid>,
    Json(req): Json<AskRequest>,
) -> Result<(StatusCode, Json<Question>)> {
    let question = state.ask_question(id, req.user_id, &req.text).await?;
    Ok((StatusCode::CREATED, Json(question)))
}

pub async fn upvote_question<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<i64>,
    Json(req): Json<UserRequest>,
) -> Result<Json<Upvote>> {
    Ok(Json(state.upvote_question(id, req.user_id).await?))
}

/// Moderators delete with their key, askers withdraw with their user id
pub async fn delete_question<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<i64>,
    Query(owner): Query<OwnerQuery>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    match (mod_key(&headers), owner.user_id) {
        (Some(key), _) => state.delete_question_as_moderator(id, key).await?,
        (None, Some(user_id)) => state.delete_own_question(id, user_id).await?,
        (None, None) => {
            return Err(Error::InvalidInput(
                "either user_id or a moderator key is required".into(),
            ))
        }
    }
    Ok(Json(json!({ "status": "Question deleted" })))
}

pub async fn begin_answering<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Handling>> {
    Ok(Json(
        state.begin_answering(id, presented_key(&headers)).await?,
    ))
}

pub async fn cancel_answering<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Question>> {
    Ok(Json(
        state.cancel_answering(id, presented_key(&headers)).await?,
    ))
}

pub async fn submit_answer<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<TextRequest>,
) -> Result<Json<Question>> {
    Ok(Json(
        state
            .submit_answer(id, presented_key(&headers), &req.text)
            .await?,
    ))
}

pub async fn begin_editing<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Handling>> {
    Ok(Json(state.begin_editing(id, presented_key(&headers)).await?))
}

pub async fn cancel_editing<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Question>> {
    Ok(Json(
        state.cancel_editing(id, presented_key(&headers)).await?,
    ))
}

pub async fn submit_edit<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<TextRequest>,
) -> Result<Json<Question>> {
    Ok(Json(
        state
            .submit_edit(id, presented_key(&headers), &req.text)
            .await?,
    ))
}

pub async fn create_poll<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<TextRequest>,
) -> Result<(StatusCode, Json<Poll>)> {
    let poll = state
        .create_poll(id, presented_key(&headers), &req.text)
        .await?;
    Ok((StatusCode::CREATED, Json(poll)))
}

pub async fn fetch_poll_for_student<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<Uuid>,
) -> Result<Json<PollView>> {
    Ok(Json(state.fetch_for_student(id).await?))
}

pub async fn fetch_poll_for_moderator<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<PollView>> {
    Ok(Json(
        state.fetch_for_moderator(id, presented_key(&headers)).await?,
    ))
}

pub async fn add_option<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<OptionRequest>,
) -> Result<(StatusCode, Json<PollOption>)> {
    let option = state
        .add_option(id, presented_key(&headers), &req.text, req.correct)
        .await?;
    Ok((StatusCode::CREATED, Json(option)))
}

pub async fn toggle_poll<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Poll>> {
    Ok(Json(state.toggle_poll(id, presented_key(&headers)).await?))
}

pub async fn reset_poll_votes<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<PollView>> {
    Ok(Json(
        state.reset_poll_votes(id, presented_key(&headers)).await?,
    ))
}

/// Vote for a poll option
pub async fn cast_poll_vote<S: Store>(
    State(state): AppStateRef<S>,
    Path(id): Path<i64>,
    Json(req): Json<UserRequest>,
) -> Result<Json<PollVote>> {
    Ok(Json(state.cast_poll_vote(id, req.user_id).await?))
}
