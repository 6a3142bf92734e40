pub mod duplex;
pub mod websocket;

pub use duplex::{DEFAULT_CAPACITY, Duplex, bind};
pub use websocket::{
  AxumWebsocket, AxumWebsocketReceiver, AxumWebsocketSender,
  TungsteniteWebsocket, TungsteniteWebsocketReceiver,
  TungsteniteWebsocketSender, Websocket, WebsocketReceiver,
  WebsocketSender,
};
