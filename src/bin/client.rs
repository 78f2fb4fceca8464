//! Geomys interactive client REPL executable.

use clap::Parser;
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;

use geomys::{GeomysError, WireRequest, WireResponse, MAX_FRAME_BYTES};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Server host.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server client API port.
    #[arg(short, long, default_value_t = 6379)]
    port: u16,
}

/// Splits an input line into tokens, honoring double quotes.
fn tokenize(input: &str) -> Result<Vec<String>, GeomysError> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in input.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                if !in_quotes {
                    parts.push(std::mem::take(&mut current));
                }
            }
            ' ' if !in_quotes => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }

    if in_quotes {
        return Err(GeomysError::InvalidArgument(
            "unmatched quotes in input".into(),
        ));
    }
    Ok(parts)
}

/// Builds the wire request for one tokenized input line.
fn build_request(parts: &[String]) -> Result<WireRequest, GeomysError> {
    let invalid = |m: &str| Err(GeomysError::InvalidArgument(m.to_string()));
    if parts.is_empty() {
        return invalid("no command entered");
    }

    let command = parts[0].to_uppercase();
    let mut req = WireRequest {
        command: command.clone(),
        ..WireRequest::default()
    };

    match command.as_str() {
        "PING" | "FLUSHDB" => {
            if parts.len() > 1 {
                return invalid("command does not take any arguments");
            }
        }

        "ECHO" => {
            if parts.len() < 2 {
                return invalid("ECHO requires a message");
            }
            req.message = Some(parts[1..].join(" "));
        }

        "SET" => {
            if parts.len() < 3 {
                return invalid(
                    "SET requires a key, value, and optional expiry",
                );
            }
            req.key = Some(parts[1].clone());
            req.value = Some(parts[2].clone());
            if parts.len() > 3 {
                let exp: i64 = parts[3].parse().map_err(|_| {
                    GeomysError::InvalidArgument(format!(
                        "invalid expiry value: {}",
                        parts[3]
                    ))
                })?;
                req.exp = Some(exp);
            }
        }

        "GET" => {
            if parts.len() < 2 {
                return invalid("GET requires a key");
            }
            req.key = Some(parts[1].clone());
        }

        "INCR" => {
            if parts.len() < 3 {
                return invalid("INCR requires a key and offset");
            }
            req.key = Some(parts[1].clone());
            req.offset = Some(parts[2].clone());
        }

        "PUSH" => {
            if parts.len() < 3 {
                return invalid("PUSH requires a key, value");
            }
            req.key = Some(parts[1].clone());
            req.value = Some(parts[2].clone());
        }

        "LPOP" | "RPOP" => {
            if parts.len() < 2 {
                return invalid("command requires a key");
            }
            req.key = Some(parts[1].clone());
        }

        _ => return invalid("unknown command"),
    }

    Ok(req)
}

/// Renders a wire response for the terminal.
fn render_response(resp: &WireResponse) -> String {
    match resp.status.as_str() {
        "OK" => {
            if let Some(value) = &resp.value {
                value.clone()
            } else if let Some(message) = &resp.message {
                message.clone()
            } else {
                "OK".into()
            }
        }
        _ => format!(
            "(error) {}",
            resp.message.as_deref().unwrap_or("request failed")
        ),
    }
}

async fn repl(mut conn: TcpStream) -> Result<(), GeomysError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut frame = [0u8; MAX_FRAME_BYTES];

    loop {
        stdout.write_all(b"geomys> ").await?;
        stdout.flush().await?;

        let line = match lines.next_line().await? {
            Some(line) => line,
            None => return Ok(()), // stdin closed
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("exit")
            || input.eq_ignore_ascii_case("quit")
        {
            return Ok(());
        }

        let req = match tokenize(input).and_then(|p| build_request(&p)) {
            Ok(req) => req,
            Err(e) => {
                stdout
                    .write_all(format!("(error) {}\n", e).as_bytes())
                    .await?;
                continue;
            }
        };

        let req_bytes = rmp_serde::encode::to_vec_named(&req)?;
        conn.write_all(&req_bytes[..]).await?;

        let n = conn.read(&mut frame).await?;
        if n == 0 {
            return Err(GeomysError::Transient(
                "server closed the connection".into(),
            ));
        }
        let resp: WireResponse = rmp_serde::decode::from_slice(&frame[..n])?;
        stdout
            .write_all(format!("{}\n", render_response(&resp)).as_bytes())
            .await?;
    }
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    let addr = format!("{}:{}", args.host, args.port);

    let conn = match TcpStream::connect(&addr).await {
        Ok(conn) => {
            println!("connected to geomys at {}", addr);
            conn
        }
        Err(e) => {
            eprintln!("cannot connect to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = repl(conn).await {
        eprintln!("session ended: {}", e);
        std::process::exit(1);
    }
}
