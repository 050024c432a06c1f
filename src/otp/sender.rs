//! OTP delivery channels.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, info};

use super::mask_destination;

const SMTP_TIMEOUT: Duration = Duration::from_secs(10);
const SMTP_HELO_DOMAIN: &str = "identity-access.local";
const OTP_SUBJECT: &str = "Your Berhot verification code";

#[async_trait]
pub trait OtpSender: Send + Sync {
    async fn send(&self, destination: &str, code: &str) -> Result<()>;
}

/// Development sender: logs the masked destination, and the code only at debug level.
#[derive(Clone, Debug, Default)]
pub struct ConsoleSender;

#[async_trait]
impl OtpSender for ConsoleSender {
    async fn send(&self, destination: &str, code: &str) -> Result<()> {
        info!(destination = %mask_destination(destination), "otp delivered to console");
        debug!(destination, code, "otp code");
        Ok(())
    }
}

/// Plain SMTP relay sender (e.g. Mailhog in development).
#[derive(Clone, Debug)]
pub struct SmtpSender {
    host: String,
    port: u16,
    from: String,
}

impl SmtpSender {
    #[must_use]
    pub fn new(host: String, port: u16, from: String) -> Self {
        Self { host, port, from }
    }

    async fn deliver(&self, to: &str, body: &str) -> Result<()> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("failed to connect to SMTP relay {}:{}", self.host, self.port))?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        expect_status(&mut reader, 2).await?;
        command(&mut write_half, &mut reader, &format!("EHLO {SMTP_HELO_DOMAIN}\r\n"), 2).await?;
        command(&mut write_half, &mut reader, &format!("MAIL FROM:<{}>\r\n", self.from), 2).await?;
        command(&mut write_half, &mut reader, &format!("RCPT TO:<{to}>\r\n"), 2).await?;
        command(&mut write_half, &mut reader, "DATA\r\n", 3).await?;
        command(&mut write_half, &mut reader, &message(&self.from, to, body), 2).await?;
        command(&mut write_half, &mut reader, "QUIT\r\n", 2).await?;
        Ok(())
    }
}

#[async_trait]
impl OtpSender for SmtpSender {
    async fn send(&self, destination: &str, code: &str) -> Result<()> {
        let body = format!(
            "Your verification code is: {code}\r\n\r\nThis code expires in 5 minutes.\r\n\r\nIf you didn't request this code, please ignore this email."
        );
        timeout(SMTP_TIMEOUT, self.deliver(destination, &body))
            .await
            .map_err(|_| anyhow!("SMTP delivery timed out"))??;
        info!(destination = %mask_destination(destination), "otp email sent");
        Ok(())
    }
}

/// Routes addresses containing `@` to the email channel, everything else to phone.
#[derive(Clone)]
pub struct MultiSender {
    email: Arc<dyn OtpSender>,
    phone: Arc<dyn OtpSender>,
}

impl MultiSender {
    #[must_use]
    pub fn new(email: Arc<dyn OtpSender>, phone: Arc<dyn OtpSender>) -> Self {
        Self { email, phone }
    }
}

#[async_trait]
impl OtpSender for MultiSender {
    async fn send(&self, destination: &str, code: &str) -> Result<()> {
        if destination.contains('@') {
            self.email.send(destination, code).await
        } else {
            self.phone.send(destination, code).await
        }
    }
}

fn message(from: &str, to: &str, body: &str) -> String {
    // Dot-stuff lines that start with '.' so the body cannot end DATA early.
    let body = body
        .split("\r\n")
        .map(|line| {
            if line.starts_with('.') {
                format!(".{line}")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\r\n");
    format!(
        "From: {from}\r\n\
         To: {to}\r\n\
         Subject: {OTP_SUBJECT}\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: text/plain; charset=UTF-8\r\n\
         \r\n\
         {body}\r\n\
         .\r\n"
    )
}

async fn command<W, R>(writer: &mut W, reader: &mut BufReader<R>, line: &str, class: u16) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    R: tokio::io::AsyncRead + Unpin,
{
    writer
        .write_all(line.as_bytes())
        .await
        .context("SMTP write failed")?;
    expect_status(reader, class).await
}

async fn expect_status<R>(reader: &mut BufReader<R>, class: u16) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let status = read_reply(reader).await?;
    if status / 100 != class {
        bail!("SMTP relay replied {status}, expected {class}xx");
    }
    Ok(())
}

/// Read one (possibly multi-line) reply and return its status code.
async fn read_reply<R>(reader: &mut BufReader<R>) -> Result<u16>
where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .await
            .context("SMTP read failed")?;
        if read == 0 {
            bail!("SMTP relay closed the connection");
        }
        let (status, last) = parse_reply_line(&line)?;
        if last {
            return Ok(status);
        }
    }
}

fn parse_reply_line(line: &str) -> Result<(u16, bool)> {
    let status = line
        .get(..3)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| anyhow!("malformed SMTP reply"))?;
    Ok((status, line.as_bytes().get(3) != Some(&b'-')))
}
