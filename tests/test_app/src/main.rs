//! Backend app spawned by the gateway's real-process tests
//!
//! Listens on `127.0.0.1:$PORT` and answers as `$APP_NAME`:
//! - `GET /health`: 200 once the listener is bound
//! - `GET /name`: the app name as plain text
//! - `GET /ws` with a WebSocket upgrade: echoes text frames until close
//!
//! Every HTTP response carries `X-App-Name`.

use base64::Engine;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_HEAD: usize = 8192;

const OP_TEXT: u8 = 0x1;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

struct RequestHead {
    path: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn parse(raw: &str) -> Option<Self> {
        let mut lines = raw.split("\r\n");
        let target = lines.next()?.split(' ').nth(1)?;
        let path = target.split('?').next().unwrap_or(target).to_string();
        let headers = lines
            .take_while(|line| !line.is_empty())
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
            .collect();
        Some(Self { path, headers })
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn wants_websocket(&self) -> bool {
        self.header("upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let port = std::env::var("PORT").unwrap_or_default();
    let name = std::env::var("APP_NAME").unwrap_or_else(|_| "app".to_string());

    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    eprintln!("test-app {}: listening on {}", name, listener.local_addr()?);

    loop {
        let (stream, _) = listener.accept().await?;
        let name = name.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(stream, &name).await {
                eprintln!("test-app {}: connection error: {}", name, e);
            }
        });
    }
}

async fn serve(mut stream: TcpStream, name: &str) -> std::io::Result<()> {
    let Some(head) = read_head(&mut stream).await? else {
        return Ok(());
    };

    match head.path.as_str() {
        "/ws" if head.wants_websocket() => match head.header("sec-websocket-key") {
            Some(key) => {
                let handshake = format!(
                    "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
                    accept_key(key)
                );
                stream.write_all(handshake.as_bytes()).await?;
                echo_frames(&mut stream).await
            }
            None => respond(&mut stream, name, "400 Bad Request", "missing key").await,
        },
        "/health" => respond(&mut stream, name, "200 OK", "ok").await,
        "/name" => respond(&mut stream, name, "200 OK", name).await,
        _ => respond(&mut stream, name, "404 Not Found", "not found").await,
    }
}

async fn read_head(stream: &mut TcpStream) -> std::io::Result<Option<RequestHead>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await?;
        if n == 0 || buf.len() + n > MAX_HEAD {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(RequestHead::parse(&String::from_utf8_lossy(&buf)))
}

async fn respond(stream: &mut TcpStream, name: &str, status: &str, body: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nX-App-Name: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        name,
        body
    );
    stream.write_all(response.as_bytes()).await
}

fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Echo text frames, answer pings, and return after replying to a close
async fn echo_frames<S>(stream: &mut S) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let (opcode, payload) = match read_frame(stream).await {
            Ok(frame) => frame,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        match opcode {
            OP_TEXT => write_frame(stream, OP_TEXT, &payload).await?,
            OP_PING => write_frame(stream, OP_PONG, &payload).await?,
            OP_CLOSE => return write_frame(stream, OP_CLOSE, &[]).await,
            _ => {}
        }
    }
}

async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<(u8, Vec<u8>)> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let opcode = head[0] & 0x0F;
    let masked = head[1] & 0x80 != 0;

    let len = match head[1] & 0x7F {
        126 => stream.read_u16().await? as usize,
        127 => stream.read_u64().await? as usize,
        n => n as usize,
    };

    let mut mask = [0u8; 4];
    if masked {
        stream.read_exact(&mut mask).await?;
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    if masked {
        payload.iter_mut().zip(mask.iter().cycle()).for_each(|(b, m)| *b ^= m);
    }
    Ok((opcode, payload))
}

async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, opcode: u8, payload: &[u8]) -> std::io::Result<()> {
    let mut frame = vec![0x80 | opcode];
    match payload.len() {
        n if n < 126 => frame.push(n as u8),
        n if n <= u16::MAX as usize => {
            frame.push(126);
            frame.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            frame.push(127);
            frame.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_key() {
        // RFC 6455 section 1.3
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kxoCZzo+xOo4YTo=");
    }

    #[test]
    fn test_parse_head() {
        let head = RequestHead::parse(
            "GET /ws?app=two HTTP/1.1\r\nUpgrade: WebSocket\r\nSec-WebSocket-Key: abc\r\n\r\n",
        )
        .unwrap();
        assert_eq!(head.path, "/ws");
        assert!(head.wants_websocket());
        assert_eq!(head.header("sec-websocket-key"), Some("abc"));
    }

    #[tokio::test]
    async fn test_echo_frames() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let echo = tokio::spawn(async move { echo_frames(&mut server).await });

        let mask = [9u8, 8, 7, 6];
        let mut text = vec![0x81, 0x80 | 3];
        text.extend_from_slice(&mask);
        text.extend(b"abc".iter().zip(mask.iter().cycle()).map(|(b, m)| b ^ m));
        client.write_all(&text).await.unwrap();
        client.write_all(&[0x88, 0x00]).await.unwrap();

        let mut reply = [0u8; 7];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, &[0x81, 3, b'a', b'b', b'c', 0x88, 0]);
        echo.await.unwrap().unwrap();
    }
}
