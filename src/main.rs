mod args;
mod auth;
mod backend;
mod note;
mod notekeep;
mod session;
mod time;
mod user;

use std::convert::Infallible;
use std::sync::Arc;

use clap::Parser;
use cookie::{Cookie, SameSite};
use log::{error, info};
use serde::Serialize;
use warp::http::header::{ACCEPT, SET_COOKIE};
use warp::http::{HeaderMap, StatusCode, Uri};
use warp::{Filter, Rejection, Reply};

use crate::args::Args;
use crate::auth::{Credentials, SessionId};
use crate::backend::Backend;
use crate::note::NoteDraft;
use crate::notekeep::{Error, NoteKeep, NoteKeepAuthed};
use crate::session::SessionStore;

const SESSION_COOKIE: &str = "sessionid";

const BODY_LIMIT: u64 = 64 * 1024;

#[tokio::main]
async fn main() {
    pretty_env_logger::init();

    let args = Args::parse();
    let addr = match args.addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!("invalid listen address: {e}");
            std::process::exit(1);
        }
    };

    let backend = Backend::new(args.data_dir()).await;
    let sessions = SessionStore::new(args.session_idle_secs());
    let keep = Arc::new(NoteKeep::new(backend, sessions));

    info!("serving on {addr}");

    warp::serve(routes(keep, args.secure())).run(addr).await;
}

fn routes(
    keep: Arc<NoteKeep>,
    secure: bool,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let landing = warp::path::end()
        .and(warp::get())
        .map(|| warp::reply::html(HOME_PAGE));

    let login_page = warp::path!("login")
        .and(warp::get())
        .map(|| warp::reply::html(LOGIN_PAGE));

    let login = warp::path!("login")
        .and(warp::post())
        .and(with_keep(&keep))
        .and(interactive())
        .and(form_or_json::<Credentials>())
        .and_then(
            move |keep: Arc<NoteKeep>, interactive: bool, creds: Credentials| async move {
                Ok::<_, Rejection>(match keep.login(creds).await {
                    Ok(authed) => {
                        let cookie = session_cookie(authed.session_id(), secure);
                        if interactive {
                            boxed(warp::reply::with_header(
                                warp::redirect::see_other(Uri::from_static("/notes")),
                                SET_COOKIE,
                                cookie,
                            ))
                        } else {
                            boxed(warp::reply::with_header(
                                warp::reply::json(&LoginReply {
                                    username: authed.username().into(),
                                }),
                                SET_COOKIE,
                                cookie,
                            ))
                        }
                    }
                    Err(e) => {
                        if interactive {
                            boxed(warp::reply::with_status(
                                warp::reply::html(LOGIN_FAILED_PAGE),
                                e.into(),
                            ))
                        } else {
                            boxed(error_reply(e))
                        }
                    }
                })
            },
        );

    let register_page = warp::path!("register")
        .and(warp::get())
        .map(|| warp::reply::html(REGISTER_PAGE));

    let register = warp::path!("register")
        .and(warp::post())
        .and(with_keep(&keep))
        .and(interactive())
        .and(form_or_json::<Credentials>())
        .and_then(
            |keep: Arc<NoteKeep>, interactive: bool, creds: Credentials| async move {
                Ok::<_, Rejection>(match keep.register(creds).await {
                    Ok(id) => {
                        if interactive {
                            boxed(warp::redirect::see_other(Uri::from_static("/login")))
                        } else {
                            boxed(warp::reply::with_status(
                                warp::reply::json(&CreatedReply { id }),
                                StatusCode::CREATED,
                            ))
                        }
                    }
                    Err(e) => boxed(error_reply(e)),
                })
            },
        );

    let logout = warp::path!("logout")
        .and(warp::get())
        .and(authed(&keep))
        .and_then(
            move |authed: NoteKeepAuthed, interactive: bool| async move {
                authed.logout();

                let cleared = clear_session_cookie(secure);
                Ok::<_, Rejection>(if interactive {
                    boxed(warp::reply::with_header(
                        warp::redirect::see_other(Uri::from_static("/")),
                        SET_COOKIE,
                        cleared,
                    ))
                } else {
                    boxed(warp::reply::with_header(
                        warp::reply::with_status(warp::reply(), StatusCode::NO_CONTENT),
                        SET_COOKIE,
                        cleared,
                    ))
                })
            },
        );

    let notes_list = warp::path!("notes")
        .and(warp::get())
        .and(authed(&keep))
        .and_then(|authed: NoteKeepAuthed, interactive: bool| async move {
            authed
                .notes()
                .await
                .map(|notes| warp::reply::json(&notes))
                .map_err(|e| deny(e, interactive))
        });

    let notes_create = warp::path!("notes")
        .and(warp::post())
        .and(authed(&keep))
        .and(form_or_json::<NoteDraft>())
        .and_then(
            |authed: NoteKeepAuthed, interactive: bool, draft: NoteDraft| async move {
                match authed.create_note(draft).await {
                    Ok(id) => Ok(if interactive {
                        boxed(warp::redirect::see_other(Uri::from_static("/notes")))
                    } else {
                        boxed(warp::reply::with_status(
                            warp::reply::json(&CreatedReply { id }),
                            StatusCode::CREATED,
                        ))
                    }),
                    Err(e) => Err(deny(e, interactive)),
                }
            },
        );

    let note_read = warp::path!("edit-note" / i64)
        .and(warp::get())
        .and(authed(&keep))
        .and_then(
            |note_id: i64, authed: NoteKeepAuthed, interactive: bool| async move {
                authed
                    .note(note_id)
                    .await
                    .map(|note| warp::reply::json(&note))
                    .map_err(|e| deny(e, interactive))
            },
        );

    let note_update = warp::path!("edit-note" / i64)
        .and(warp::post().or(warp::put()).unify())
        .and(authed(&keep))
        .and(form_or_json::<NoteDraft>())
        .and_then(
            |note_id: i64, authed: NoteKeepAuthed, interactive: bool, draft: NoteDraft| async move {
                match authed.update_note(note_id, draft).await {
                    Ok(()) => Ok(done_reply(interactive)),
                    Err(e) => Err(deny(e, interactive)),
                }
            },
        );

    let note_delete = warp::path!("delete-note" / i64)
        .and(warp::post())
        .and(authed(&keep))
        .and_then(
            |note_id: i64, authed: NoteKeepAuthed, interactive: bool| async move {
                match authed.delete_note(note_id).await {
                    Ok(()) => Ok(done_reply(interactive)),
                    Err(e) => Err(deny(e, interactive)),
                }
            },
        );

    // the old wide-open debug listings, now gated and scoped to the caller
    let all_notes = warp::path!("allnotes")
        .and(warp::get())
        .and(authed(&keep))
        .and_then(|authed: NoteKeepAuthed, interactive: bool| async move {
            authed
                .notes()
                .await
                .map(|notes| warp::reply::json(&notes))
                .map_err(|e| deny(e, interactive))
        });

    let users = warp::path!("users")
        .and(warp::get())
        .and(authed(&keep))
        .and_then(|authed: NoteKeepAuthed, interactive: bool| async move {
            authed
                .users()
                .await
                .map(|users| warp::reply::json(&users))
                .map_err(|e| deny(e, interactive))
        });

    landing
        .or(login_page)
        .or(login)
        .or(register_page)
        .or(register)
        .or(logout)
        .or(notes_list)
        .or(notes_create)
        .or(note_read)
        .or(note_update)
        .or(note_delete)
        .or(all_notes)
        .or(users)
        .recover(handle_rejection)
}

/// Resolves the session cookie to an authenticated handle, rejecting with
/// the presentation the client asked for. Every note route goes through
/// this, including the listing endpoints.
fn authed(
    keep: &Arc<NoteKeep>,
) -> impl Filter<Extract = (NoteKeepAuthed, bool), Error = Rejection> + Clone {
    with_keep(keep)
        .and(warp::cookie::optional::<String>(SESSION_COOKIE))
        .and(interactive())
        .and_then(
            |keep: Arc<NoteKeep>, cookie: Option<String>, interactive: bool| async move {
                let session_id = cookie.as_deref().and_then(|c| c.parse::<SessionId>().ok());

                let authed = match session_id {
                    Some(id) => keep.authenticate(id).await,
                    None => Err(Error::NotAuthenticated),
                };

                match authed {
                    Ok(authed) => Ok((authed, interactive)),
                    Err(e) => Err(deny(e, interactive)),
                }
            },
        )
        .untuple_one()
}

fn with_keep(
    keep: &Arc<NoteKeep>,
) -> impl Filter<Extract = (Arc<NoteKeep>,), Error = Infallible> + Clone {
    let keep = Arc::clone(keep);
    warp::any().map(move || Arc::clone(&keep))
}

/// Browsers ask for text/html; anything else is treated as an API client.
fn interactive() -> impl Filter<Extract = (bool,), Error = Infallible> + Clone {
    warp::header::headers_cloned().map(|headers: HeaderMap| {
        headers
            .get(ACCEPT)
            .and_then(|accept| accept.to_str().ok())
            .map_or(false, |accept| accept.contains("text/html"))
    })
}

/// Accepts either a browser form post or a JSON body.
fn form_or_json<T>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone
where
    T: serde::de::DeserializeOwned + Send,
{
    warp::body::content_length_limit(BODY_LIMIT)
        .and(warp::body::form().or(warp::body::json()).unify())
}

/// Rejection carrying the failure plus how the client wants it presented.
#[derive(Debug)]
struct Denied {
    error: Error,
    interactive: bool,
}

impl warp::reject::Reject for Denied {}

fn deny(error: Error, interactive: bool) -> Rejection {
    warp::reject::custom(Denied { error, interactive })
}

async fn handle_rejection(rejection: Rejection) -> Result<Box<dyn Reply>, Infallible> {
    if let Some(&Denied { error, interactive }) = rejection.find::<Denied>() {
        if interactive && error == Error::NotAuthenticated {
            return Ok(boxed(warp::redirect::see_other(Uri::from_static("/login"))));
        }
        return Ok(boxed(error_reply(error)));
    }

    let status = if rejection.is_not_found() {
        StatusCode::NOT_FOUND
    } else if rejection
        .find::<warp::filters::body::BodyDeserializeError>()
        .is_some()
    {
        StatusCode::BAD_REQUEST
    } else if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
        StatusCode::PAYLOAD_TOO_LARGE
    } else if rejection
        .find::<warp::reject::UnsupportedMediaType>()
        .is_some()
    {
        StatusCode::UNSUPPORTED_MEDIA_TYPE
    } else if rejection
        .find::<warp::reject::MethodNotAllowed>()
        .is_some()
    {
        StatusCode::METHOD_NOT_ALLOWED
    } else {
        error!("unhandled rejection: {rejection:?}");
        StatusCode::INTERNAL_SERVER_ERROR
    };

    Ok(boxed(warp::reply::with_status(
        warp::reply::json(&ErrorReply {
            error: status.canonical_reason().unwrap_or("error"),
        }),
        status,
    )))
}

fn boxed(reply: impl Reply + 'static) -> Box<dyn Reply> {
    Box::new(reply)
}

fn error_reply(e: Error) -> impl Reply {
    warp::reply::with_status(
        warp::reply::json(&ErrorReply { error: e.message() }),
        e.into(),
    )
}

fn done_reply(interactive: bool) -> Box<dyn Reply> {
    if interactive {
        boxed(warp::redirect::see_other(Uri::from_static("/notes")))
    } else {
        boxed(warp::reply::with_status(
            warp::reply(),
            StatusCode::NO_CONTENT,
        ))
    }
}

fn session_cookie(session_id: &SessionId, secure: bool) -> String {
    Cookie::build((SESSION_COOKIE, session_id.to_string()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Strict)
        .secure(secure)
        .build()
        .to_string()
}

fn clear_session_cookie(secure: bool) -> String {
    Cookie::build((SESSION_COOKIE, ""))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Strict)
        .secure(secure)
        .max_age(::time::Duration::ZERO)
        .build()
        .to_string()
}

#[derive(Serialize)]
struct LoginReply {
    username: String,
}

#[derive(Serialize)]
struct CreatedReply {
    id: i64,
}

#[derive(Serialize)]
struct ErrorReply {
    error: &'static str,
}

const HOME_PAGE: &str = r#"<!doctype html>
<html>
<head><title>notekeep</title></head>
<body>
<h1>notekeep</h1>
<p><a href="/login">Log in</a> or <a href="/register">register</a> to keep notes.</p>
</body>
</html>
"#;

const LOGIN_PAGE: &str = r#"<!doctype html>
<html>
<head><title>notekeep - log in</title></head>
<body>
<h1>Log in</h1>
<form action="/login" method="post">
<label>Username <input name="username" autocomplete="username"></label>
<label>Password <input name="password" type="password" autocomplete="current-password"></label>
<button type="submit">Log in</button>
</form>
<p><a href="/register">Register</a></p>
</body>
</html>
"#;

const LOGIN_FAILED_PAGE: &str = r#"<!doctype html>
<html>
<head><title>notekeep - log in</title></head>
<body>
<h1>Log in</h1>
<p>Authentication failed.</p>
<form action="/login" method="post">
<label>Username <input name="username" autocomplete="username"></label>
<label>Password <input name="password" type="password" autocomplete="current-password"></label>
<button type="submit">Log in</button>
</form>
</body>
</html>
"#;

const REGISTER_PAGE: &str = r#"<!doctype html>
<html>
<head><title>notekeep - register</title></head>
<body>
<h1>Register</h1>
<form action="/register" method="post">
<label>Username <input name="username" autocomplete="username"></label>
<label>Password <input name="password" type="password" autocomplete="new-password"></label>
<button type="submit">Register</button>
</form>
</body>
</html>
"#;

#[cfg(test)]
mod test {
    use super::*;

    use crate::backend;

    async fn create_keep() -> Arc<NoteKeep> {
        let db = backend::test::create_db().await;
        Arc::new(NoteKeep::new(Backend(db), SessionStore::new(60 * 60)))
    }

    fn creds(username: &str) -> Credentials {
        Credentials {
            username: username.into(),
            password: format!("{username}-password"),
        }
    }

    /// Registers and logs in through the core, returning a Cookie header
    /// value for HTTP requests.
    async fn session_for(keep: &Arc<NoteKeep>, username: &str) -> String {
        keep.register(creds(username)).await.unwrap();
        let authed = keep.login(creds(username)).await.unwrap();
        format!("{SESSION_COOKIE}={}", authed.session_id())
    }

    #[tokio::test]
    async fn unauthenticated_browser_is_redirected() {
        let api = routes(create_keep().await, false);

        let res = warp::test::request()
            .path("/notes")
            .header("accept", "text/html")
            .reply(&api)
            .await;

        assert_eq!(res.status(), StatusCode::SEE_OTHER);
        assert_eq!(res.headers()["location"], "/login");
    }

    #[tokio::test]
    async fn unauthenticated_api_is_denied() {
        let api = routes(create_keep().await, false);

        for path in ["/notes", "/allnotes", "/users", "/edit-note/1"] {
            let res = warp::test::request().path(path).reply(&api).await;
            assert_eq!(res.status(), StatusCode::UNAUTHORIZED, "GET {path}");
        }

        let res = warp::test::request()
            .method("POST")
            .path("/delete-note/1")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn login_sets_session_cookie() {
        let keep = create_keep().await;
        keep.register(creds("alice")).await.unwrap();
        let api = routes(Arc::clone(&keep), false);

        let res = warp::test::request()
            .method("POST")
            .path("/login")
            .header("accept", "text/html")
            .header("content-type", "application/x-www-form-urlencoded")
            .body("username=alice&password=alice-password")
            .reply(&api)
            .await;

        assert_eq!(res.status(), StatusCode::SEE_OTHER);
        assert_eq!(res.headers()["location"], "/notes");

        let set_cookie = res.headers()[SET_COOKIE].to_str().unwrap();
        let cookie = Cookie::parse(set_cookie).unwrap();
        assert_eq!(cookie.name(), SESSION_COOKIE);
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Strict));
        assert_ne!(cookie.secure(), Some(true)); // no --secure, plain http

        let res = warp::test::request()
            .path("/notes")
            .header("cookie", format!("{}={}", cookie.name(), cookie.value()))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn secure_flag_marks_cookie() {
        let keep = create_keep().await;
        keep.register(creds("alice")).await.unwrap();
        let api = routes(Arc::clone(&keep), true);

        let res = warp::test::request()
            .method("POST")
            .path("/login")
            .header("content-type", "application/x-www-form-urlencoded")
            .body("username=alice&password=alice-password")
            .reply(&api)
            .await;

        assert_eq!(res.status(), StatusCode::OK);

        let set_cookie = res.headers()[SET_COOKIE].to_str().unwrap();
        let cookie = Cookie::parse(set_cookie).unwrap();
        assert_eq!(cookie.secure(), Some(true));
    }

    #[tokio::test]
    async fn failed_login_is_generic() {
        let keep = create_keep().await;
        keep.register(creds("alice")).await.unwrap();
        let api = routes(Arc::clone(&keep), false);

        let wrong_password = warp::test::request()
            .method("POST")
            .path("/login")
            .header("content-type", "application/x-www-form-urlencoded")
            .body("username=alice&password=guess")
            .reply(&api)
            .await;

        let unknown_user = warp::test::request()
            .method("POST")
            .path("/login")
            .header("content-type", "application/x-www-form-urlencoded")
            .body("username=mallory&password=guess")
            .reply(&api)
            .await;

        assert_eq!(wrong_password.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(unknown_user.status(), StatusCode::UNAUTHORIZED);
        // no hint which of the two fields was wrong
        assert_eq!(wrong_password.body(), unknown_user.body());
        assert!(wrong_password.headers().get(SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn note_crud_over_http() {
        let keep = create_keep().await;
        let api = routes(Arc::clone(&keep), false);
        let cookie = session_for(&keep, "alice").await;

        let res = warp::test::request()
            .method("POST")
            .path("/notes")
            .header("cookie", &cookie)
            .json(&serde_json::json!({"title": "shopping", "note": "eggs"}))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::CREATED);
        let created: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        let id = created["id"].as_i64().unwrap();

        let res = warp::test::request()
            .path("/notes")
            .header("cookie", &cookie)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let notes: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(notes.as_array().unwrap().len(), 1);
        assert_eq!(notes[0]["title"], "shopping");
        assert_eq!(notes[0]["content"], "eggs");

        // browser edit form posts `content`; PUT is routed the same as POST
        let res = warp::test::request()
            .method("PUT")
            .path(&format!("/edit-note/{id}"))
            .header("cookie", &cookie)
            .header("content-type", "application/x-www-form-urlencoded")
            .body("title=shopping&content=eggs+and+flour")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);

        let res = warp::test::request()
            .path(&format!("/edit-note/{id}"))
            .header("cookie", &cookie)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let note: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(note["content"], "eggs and flour");

        let res = warp::test::request()
            .method("POST")
            .path(&format!("/delete-note/{id}"))
            .header("cookie", &cookie)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);

        let res = warp::test::request()
            .path(&format!("/edit-note/{id}"))
            .header("cookie", &cookie)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn notes_stay_private_across_users() {
        let keep = create_keep().await;
        let api = routes(Arc::clone(&keep), false);

        let alice = session_for(&keep, "alice").await;
        let bob = session_for(&keep, "bob").await;

        let res = warp::test::request()
            .method("POST")
            .path("/notes")
            .header("cookie", &alice)
            .json(&serde_json::json!({"title": "secret", "note": "alice only"}))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::CREATED);
        let created: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        let id = created["id"].as_i64().unwrap();

        // bob can't read, rewrite, or delete alice's note, and can't see it
        // in any listing
        let res = warp::test::request()
            .path(&format!("/edit-note/{id}"))
            .header("cookie", &bob)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = warp::test::request()
            .method("POST")
            .path(&format!("/edit-note/{id}"))
            .header("cookie", &bob)
            .json(&serde_json::json!({"title": "mine now", "content": "taken"}))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = warp::test::request()
            .method("POST")
            .path(&format!("/delete-note/{id}"))
            .header("cookie", &bob)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        for path in ["/notes", "/allnotes"] {
            let res = warp::test::request()
                .path(path)
                .header("cookie", &bob)
                .reply(&api)
                .await;
            assert_eq!(res.status(), StatusCode::OK);
            let notes: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
            assert!(notes.as_array().unwrap().is_empty(), "GET {path}");
        }
    }

    #[tokio::test]
    async fn user_listing_is_gated_and_redacted() {
        let keep = create_keep().await;
        let api = routes(Arc::clone(&keep), false);
        let cookie = session_for(&keep, "alice").await;

        let res = warp::test::request()
            .path("/users")
            .header("cookie", &cookie)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);

        let users: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(users[0]["username"], "alice");
        assert!(users[0].get("pwhash").is_none());
    }

    #[tokio::test]
    async fn logout_invalidates_the_session() {
        let keep = create_keep().await;
        let api = routes(Arc::clone(&keep), false);
        let cookie = session_for(&keep, "alice").await;

        let res = warp::test::request()
            .path("/logout")
            .header("accept", "text/html")
            .header("cookie", &cookie)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::SEE_OTHER);
        assert_eq!(res.headers()["location"], "/");

        let set_cookie = res.headers()[SET_COOKIE].to_str().unwrap();
        assert!(set_cookie.contains("Max-Age=0"));

        let res = warp::test::request()
            .path("/notes")
            .header("cookie", &cookie)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn malformed_body_is_a_bad_request() {
        let keep = create_keep().await;
        let api = routes(Arc::clone(&keep), false);
        let cookie = session_for(&keep, "alice").await;

        let res = warp::test::request()
            .method("POST")
            .path("/notes")
            .header("cookie", &cookie)
            .header("content-type", "application/json")
            .body("{\"title\": \"no body field\"}")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}
