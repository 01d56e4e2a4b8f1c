use std::convert::Infallible;

use futures_util::{SinkExt, StreamExt, future::select};
use log::{info, warn};
use lynx_ingest_lib::Message;
use tokio::sync::broadcast::{Sender, error::RecvError};
use warp::ws::{Message as WsMsg, WebSocket};
use warp::{Filter, Rejection, Reply};

fn with_tx(
    tx: Sender<Message>,
) -> impl Filter<Extract = (Sender<Message>,), Error = Infallible> + Clone {
    warp::any().map(move || tx.clone())
}

/// WebSocket route under `/blocks`: one binary frame per decoded block.
pub fn ws_routes(
    tx: Sender<Message>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["GET", "OPTIONS"])
        .allow_headers(vec!["sec-websocket-protocol", "origin", "upgrade"]);

    warp::path("blocks")
        .and(warp::ws())
        .and(with_tx(tx))
        .map(|ws: warp::ws::Ws, tx| ws.on_upgrade(move |socket| handle_ws(socket, tx)))
        .with(cors)
}

async fn handle_ws(ws: WebSocket, tx: Sender<Message>) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut rx = tx.subscribe();

    // drain client frames so close is noticed
    let inbound = async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            if msg.is_close() {
                break;
            }
        }
    };

    let outbound = async {
        loop {
            match rx.recv().await {
                Ok(Message::Block(block)) => {
                    if ws_tx.send(WsMsg::binary(block.to_le_frame())).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Event { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("WS client lagged, dropped {} messages", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    select(Box::pin(inbound), Box::pin(outbound)).await;
    info!("WebSocket client disconnected");
}
