//! Network transports. The relay only speaks plain WebSocket.

pub mod websocket;
