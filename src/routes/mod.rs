use rocket::{
    data::{Limits, ToByteUnit},
    delete, get,
    http::{ContentType, Status},
    post, put,
    request::{FromRequest, Outcome, Request},
    response::status,
    routes,
    serde::json::Json,
    Build, Data, Rocket, Route, State,
};
use constant_time_eq::constant_time_eq;
use uuid::Uuid;

use crate::{
    artist_service::{format_follower_count, get_monthly_listeners},
    cors::CorsFairing,
    events_service::RefreshReport,
    models::{Artist, ArtistData, Event, Platform, Profile},
    profile::{IssueReport, ProfileError, ProfileUpdate},
    push::PushReport,
    state::AppState,
};

const MAX_AVATAR_SIZE_MIB: u64 = 5;
/// Issue reports carry base64 screenshots
const MAX_JSON_SIZE_MIB: u64 = 8;

type ApiResult<T> = Result<T, status::Custom<String>>;

fn bad_request(message: String) -> status::Custom<String> { status::Custom(Status::BadRequest, message) }

fn server_error(message: String) -> status::Custom<String> {
    status::Custom(Status::InternalServerError, message)
}

fn profile_error(err: ProfileError) -> status::Custom<String> {
    match err {
        ProfileError::Invalid(message) => bad_request(message),
        ProfileError::Failed(message) => server_error(message),
    }
}

#[derive(Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Serialize, Deserialize)]
pub struct FollowStatus {
    pub following: bool,
}

#[derive(Serialize, Deserialize)]
pub struct DeletedResponse {
    pub deleted: usize,
}

#[derive(Serialize, Deserialize)]
pub struct ArtistDetails {
    #[serde(flatten)]
    pub artist: ArtistData,
    pub monthly_listeners: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct PushTokenRequest {
    pub token: String,
    pub platform: Platform,
}

#[derive(Serialize, Deserialize)]
pub struct SendPushRequest {
    pub user_id: Uuid,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize)]
pub struct SendPushBatchRequest {
    pub user_ids: Vec<Uuid>,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// The bearer token sent with a request, if any
pub struct ApiToken(Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ApiToken {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let token = request
            .headers()
            .get_one("Authorization")
            .and_then(|val| val.strip_prefix("Bearer "))
            .map(|token| token.trim().to_owned());
        Outcome::Success(ApiToken(token))
    }
}

fn validate_api_token(state: &AppState, api_token: &ApiToken) -> ApiResult<()> {
    let Some(expected) = &state.admin_api_token else {
        return Ok(());
    };

    match &api_token.0 {
        Some(supplied) if constant_time_eq(supplied.as_bytes(), expected.as_bytes()) => Ok(()),
        _ => Err(status::Custom(
            Status::Unauthorized,
            "Invalid API token supplied".into(),
        )),
    }
}

fn parse_user_id(user_id: &str) -> Option<Uuid> {
    match Uuid::parse_str(user_id) {
        Ok(id) => Some(id),
        Err(_) => {
            warn!("Invalid user id in request path: {:?}", user_id);
            None
        },
    }
}

#[get("/")]
pub fn index() -> &'static str { "Application successfully started!" }

#[get("/artists/search?<q>")]
pub async fn search_artists(state: &State<AppState>, q: &str) -> Json<Vec<ArtistData>> {
    Json(state.artists.search_artists(q).await)
}

#[get("/artists/<spotify_id>")]
pub async fn get_artist(state: &State<AppState>, spotify_id: &str) -> Option<Json<ArtistDetails>> {
    let artist = state.artists.artist_details(spotify_id).await?;
    let monthly_listeners = artist
        .followers_count
        .map(|count| get_monthly_listeners(&format_follower_count(count)));

    Some(Json(ArtistDetails {
        artist,
        monthly_listeners,
    }))
}

#[get("/artists/<spotify_id>/events")]
pub async fn get_artist_events(state: &State<AppState>, spotify_id: &str) -> Json<Vec<Event>> {
    match state.artists.saved_artist(spotify_id).await {
        Some(artist) => Json(state.events.artist_events(artist.id).await),
        // Nobody follows this artist, so no events have been synced for it
        None => Json(Vec::new()),
    }
}

#[post("/users/<user_id>/follows", data = "<artist>")]
pub async fn follow_artist(
    state: &State<AppState>,
    user_id: &str,
    artist: Json<ArtistData>,
) -> Option<Json<SuccessResponse>> {
    let user_id = parse_user_id(user_id)?;
    let success = state.artists.follow_artist(user_id, artist.into_inner()).await;
    Some(Json(SuccessResponse { success }))
}

#[get("/users/<user_id>/follows")]
pub async fn get_followed_artists(
    state: &State<AppState>,
    user_id: &str,
) -> Option<Json<Vec<Artist>>> {
    let user_id = parse_user_id(user_id)?;
    Some(Json(state.artists.followed_artists(user_id).await))
}

#[get("/users/<user_id>/follows/<spotify_id>")]
pub async fn get_follow_status(
    state: &State<AppState>,
    user_id: &str,
    spotify_id: &str,
) -> Option<Json<FollowStatus>> {
    let user_id = parse_user_id(user_id)?;
    let following = state.artists.is_following(user_id, spotify_id).await;
    Some(Json(FollowStatus { following }))
}

#[delete("/users/<user_id>/follows/<spotify_id>")]
pub async fn unfollow_artist(
    state: &State<AppState>,
    user_id: &str,
    spotify_id: &str,
) -> Option<Json<SuccessResponse>> {
    let user_id = parse_user_id(user_id)?;
    let success = state.artists.unfollow_artist(user_id, spotify_id).await;
    Some(Json(SuccessResponse { success }))
}

#[get("/users/<user_id>/events")]
pub async fn get_user_events(state: &State<AppState>, user_id: &str) -> Option<Json<Vec<Event>>> {
    let user_id = parse_user_id(user_id)?;
    Some(Json(state.events.upcoming_events_for_user(user_id).await))
}

#[put("/users/<user_id>/push_token", data = "<req>")]
pub async fn register_push_token(
    state: &State<AppState>,
    user_id: &str,
    req: Json<PushTokenRequest>,
) -> ApiResult<Option<Json<SuccessResponse>>> {
    let Some(user_id) = parse_user_id(user_id) else {
        return Ok(None);
    };
    let token = req.token.trim();
    if token.is_empty() {
        return Err(bad_request("Push token must not be empty".into()));
    }

    state
        .store
        .upsert_push_token(user_id, token, req.platform)
        .await
        .map_err(|err| {
            error!("Error saving push token for user {}: {:?}", user_id, err);
            server_error("Error saving push token".into())
        })?;
    info!("Registered {} push token for user {}", req.platform.as_str(), user_id);

    Ok(Some(Json(SuccessResponse { success: true })))
}

#[delete("/users/<user_id>/push_token?<platform>")]
pub async fn delete_push_token(
    state: &State<AppState>,
    user_id: &str,
    platform: Option<&str>,
) -> ApiResult<Option<Json<DeletedResponse>>> {
    let Some(user_id) = parse_user_id(user_id) else {
        return Ok(None);
    };
    let platform = match platform {
        Some(raw) => Some(Platform::parse(raw).ok_or_else(|| bad_request(format!("Unknown platform: {}", raw)))?),
        None => None,
    };

    let deleted = state
        .store
        .delete_push_tokens(user_id, platform)
        .await
        .map_err(|err| {
            error!("Error deleting push tokens for user {}: {:?}", user_id, err);
            server_error("Error deleting push tokens".into())
        })?;

    Ok(Some(Json(DeletedResponse { deleted })))
}

#[get("/users/<user_id>/profile?<refresh>")]
pub async fn get_profile(
    state: &State<AppState>,
    user_id: &str,
    refresh: Option<bool>,
) -> ApiResult<Option<Json<Profile>>> {
    let Some(user_id) = parse_user_id(user_id) else {
        return Ok(None);
    };

    let profile = if refresh.unwrap_or(false) {
        state.profiles.sync(user_id).await
    } else {
        state.profiles.load(user_id).await
    };
    Ok(profile.map_err(profile_error)?.map(Json))
}

#[put("/users/<user_id>/profile", data = "<update>")]
pub async fn update_profile(
    state: &State<AppState>,
    user_id: &str,
    update: Json<ProfileUpdate>,
) -> ApiResult<Option<Json<Profile>>> {
    let Some(user_id) = parse_user_id(user_id) else {
        return Ok(None);
    };
    let profile = state
        .profiles
        .update(user_id, update.into_inner())
        .await
        .map_err(profile_error)?;
    Ok(Some(Json(profile)))
}

#[put("/users/<user_id>/avatar", data = "<data>")]
pub async fn upload_avatar(
    state: &State<AppState>,
    user_id: &str,
    content_type: &ContentType,
    data: Data<'_>,
) -> ApiResult<Option<Json<Profile>>> {
    let Some(user_id) = parse_user_id(user_id) else {
        return Ok(None);
    };

    let bytes = data
        .open(MAX_AVATAR_SIZE_MIB.mebibytes())
        .into_bytes()
        .await
        .map_err(|err| {
            error!("Error reading avatar upload for user {}: {:?}", user_id, err);
            server_error("Error reading upload".into())
        })?;
    if !bytes.is_complete() {
        return Err(status::Custom(
            Status::PayloadTooLarge,
            format!("Avatar images are limited to {} MiB", MAX_AVATAR_SIZE_MIB),
        ));
    }

    let media_type = format!("{}/{}", content_type.top(), content_type.sub());
    let profile = state
        .profiles
        .upload_avatar(user_id, &media_type, bytes.into_inner())
        .await
        .map_err(profile_error)?;
    Ok(Some(Json(profile)))
}

#[post("/issues", data = "<report>")]
pub async fn report_issue(
    state: &State<AppState>,
    report: Json<IssueReport>,
) -> ApiResult<Json<SuccessResponse>> {
    state
        .profiles
        .report_issue(report.into_inner())
        .await
        .map_err(profile_error)?;
    Ok(Json(SuccessResponse { success: true }))
}

/// Syncs events for every followed artist, notifies followers of new ones and cleans up past events.  Hit by the
/// scheduler; the service also runs it on its own interval.
#[post("/functions/refresh-events")]
pub async fn refresh_events(
    state: &State<AppState>,
    api_token: ApiToken,
) -> ApiResult<Json<RefreshReport>> {
    validate_api_token(state, &api_token)?;
    Ok(Json(state.events.refresh_all_events(&state.push).await))
}

#[post("/functions/send-push-notification", data = "<req>")]
pub async fn send_push_notification(
    state: &State<AppState>,
    api_token: ApiToken,
    req: Json<SendPushRequest>,
) -> ApiResult<Json<PushReport>> {
    validate_api_token(state, &api_token)?;
    let req = req.into_inner();

    state
        .push
        .notify_user(
            req.user_id,
            &req.title,
            &req.body,
            req.data.unwrap_or(serde_json::Value::Null),
        )
        .await
        .map(Json)
        .map_err(|err| {
            error!("Error sending push notification to user {}: {:?}", req.user_id, err);
            server_error("Error sending push notification".into())
        })
}

#[post("/functions/send-push-notifications", data = "<req>")]
pub async fn send_push_notifications(
    state: &State<AppState>,
    api_token: ApiToken,
    req: Json<SendPushBatchRequest>,
) -> ApiResult<Json<PushReport>> {
    validate_api_token(state, &api_token)?;
    let req = req.into_inner();
    if req.user_ids.is_empty() {
        return Ok(Json(PushReport::default()));
    }

    state
        .push
        .notify_users(
            &req.user_ids,
            &req.title,
            &req.body,
            req.data.unwrap_or(serde_json::Value::Null),
        )
        .await
        .map(Json)
        .map_err(|err| {
            error!("Error sending push notifications to {} users: {:?}", req.user_ids.len(), err);
            server_error("Error sending push notifications".into())
        })
}

pub fn all_routes() -> Vec<Route> {
    routes![
        index,
        search_artists,
        get_artist,
        get_artist_events,
        follow_artist,
        get_followed_artists,
        get_follow_status,
        unfollow_artist,
        get_user_events,
        register_push_token,
        delete_push_token,
        get_profile,
        update_profile,
        upload_avatar,
        report_issue,
        refresh_events,
        send_push_notification,
        send_push_notifications,
    ]
}

pub fn build_rocket(state: AppState) -> Rocket<Build> {
    let limits = Limits::default().limit("json", MAX_JSON_SIZE_MIB.mebibytes());
    let figment = rocket::Config::figment().merge(("limits", limits));

    rocket::custom(figment)
        .mount("/", all_routes())
        .mount("/api/", all_routes())
        .manage(state)
        .attach(CorsFairing)
}
