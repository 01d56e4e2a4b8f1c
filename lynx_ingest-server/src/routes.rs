use std::convert::Infallible;
use std::net::IpAddr;

use async_stream::stream;
use log::{info, warn};
use lynx_ingest_lib::Message;
use serde::Deserialize;
use tokio::sync::broadcast::{Sender, error::RecvError};
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::sse::{Event, keep_alive, reply};
use warp::{Filter, Rejection, Reply};

use crate::control::{Command, ControlHandle};

#[derive(Clone, Debug, Deserialize)]
pub struct AddressRequest {
    pub address: IpAddr,
}

fn with_control(
    control: ControlHandle,
) -> impl Filter<Extract = (ControlHandle,), Error = Infallible> + Clone {
    warp::any().map(move || control.clone())
}

fn outcome<T>(result: Result<T, String>, rejected: StatusCode) -> warp::reply::Response {
    match result {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(msg) => warp::reply::with_status(msg, rejected).into_response(),
    }
}

/// Status, configuration and lifecycle endpoints plus the `/events` SSE stream.
pub fn control_routes(
    control: ControlHandle,
    tx: Sender<Message>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let health = warp::get().and(warp::path!("health")).map(|| "OK");

    // GET /status
    let status = warp::get()
        .and(warp::path!("status"))
        .and(with_control(control.clone()))
        .and_then(|control: ControlHandle| async move {
            let reply = match control.status().await {
                Some(status) => warp::reply::json(&status).into_response(),
                None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
            };
            Ok::<_, Rejection>(reply)
        });

    // POST /port, plain-text body
    let port = warp::post()
        .and(warp::path!("port"))
        .and(warp::body::content_length_limit(64))
        .and(warp::body::bytes())
        .and(with_control(control.clone()))
        .and_then(|body: Bytes, control: ControlHandle| async move {
            let text = String::from_utf8_lossy(&body).into_owned();
            info!("POST /port: {:?}", text);
            let result = control.request(|reply| Command::SetPort(text, reply)).await;
            Ok::<_, Rejection>(match result {
                Ok(port) => warp::reply::json(&port).into_response(),
                Err(msg) => warp::reply::with_status(msg, StatusCode::BAD_REQUEST).into_response(),
            })
        });

    // POST /address
    let address = warp::post()
        .and(warp::path!("address"))
        .and(warp::body::json::<AddressRequest>())
        .and(with_control(control.clone()))
        .and_then(|req: AddressRequest, control: ControlHandle| async move {
            info!("POST /address: {}", req.address);
            let result = control
                .request(|reply| Command::SelectAddress(req.address, reply))
                .await;
            Ok::<_, Rejection>(outcome(result, StatusCode::BAD_REQUEST))
        });

    let refresh = warp::post()
        .and(warp::path!("refresh"))
        .and(with_control(control.clone()))
        .and_then(|control: ControlHandle| async move {
            let result = control.request(Command::Refresh).await;
            Ok::<_, Rejection>(outcome(result, StatusCode::CONFLICT))
        });

    let start = warp::post()
        .and(warp::path!("start"))
        .and(with_control(control.clone()))
        .and_then(|control: ControlHandle| async move {
            info!("POST /start");
            let result = control.request(Command::Start).await;
            Ok::<_, Rejection>(outcome(result, StatusCode::CONFLICT))
        });

    let stop = warp::post()
        .and(warp::path!("stop"))
        .and(with_control(control))
        .and_then(|control: ControlHandle| async move {
            info!("POST /stop");
            let result = control.request(Command::Stop).await;
            Ok::<_, Rejection>(outcome(result, StatusCode::INTERNAL_SERVER_ERROR))
        });

    // GET /events → SSE
    let events = warp::get().and(warp::path!("events")).map(move || {
        let mut rx = tx.subscribe();
        let event_stream = stream! {
            loop {
                match rx.recv().await {
                    Ok(msg @ Message::Event { .. }) => match serde_json::to_string(&msg) {
                        Ok(json) => {
                            yield Ok::<_, Infallible>(Event::default().data(json));
                        }
                        Err(e) => warn!("Dropping unserializable event: {}", e),
                    },
                    Ok(Message::Block(_)) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("SSE client lagged, dropped {} messages", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        };
        reply(keep_alive().stream(event_stream))
    });

    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["OPTIONS", "GET", "POST"])
        .allow_headers(vec!["content-type", "accept", "last-event-id", "origin"]);

    health
        .or(status)
        .or(port)
        .or(address)
        .or(refresh)
        .or(start)
        .or(stop)
        .or(events)
        .with(cors)
}
