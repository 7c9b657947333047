use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::path::PathBuf;
use std::time::Duration;

use bytes::{Buf, Bytes};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use sha2::digest::FixedOutput;
use sha2::Sha256;

use tokio::io::AsyncWriteExt;
use tokio::net;
use url::Url;

use super::buf_ext::BufExt;
use super::cancel::CancelHandle;
use super::query::{Column, QueryResult, QueryResults, SelectQueryResult};
use super::stream::Stream;

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
  pub user: String,
  pub password: Option<String>,
  pub database: Option<String>,
  pub connect_timeout: Option<Duration>,
  pub read_timeout: Option<Duration>,
  pub write_timeout: Option<Duration>,
}

impl Default for ConnectionOptions {
  fn default() -> Self {
    Self {
      user: "postgres".to_string(),
      password: None,
      database: None,
      connect_timeout: None,
      read_timeout: None,
      write_timeout: None,
    }
  }
}

impl TryFrom<&Url> for ConnectionOptions {
  type Error = io::Error;

  fn try_from(url: &Url) -> Result<Self, Self::Error> {
    let user = match url.username() {
      "" => "postgres".to_string(),
      user => user.to_string(),
    };
    let password = url.password().map(ToString::to_string);

    let query_pairs = url.query_pairs().collect::<BTreeMap<_, _>>();
    let database = query_pairs
      .get("database")
      .map(|v| v.to_string())
      .or_else(|| match url.path().trim_start_matches('/') {
        "" => None,
        path => Some(path.to_string()),
      });

    let connect_timeout = query_pairs
      .get("connect_timeout_ms")
      .and_then(|v| v.parse().ok())
      .map(Duration::from_millis);

    let read_timeout = query_pairs
      .get("read_timeout_ms")
      .and_then(|v| v.parse().ok())
      .map(Duration::from_millis);

    let write_timeout = query_pairs
      .get("write_timeout_ms")
      .and_then(|v| v.parse().ok())
      .map(Duration::from_millis);

    Ok(Self {
      user,
      password,
      database,
      connect_timeout,
      read_timeout,
      write_timeout,
    })
  }
}

const PROTOCOL_VERSION: i32 = 196608;

#[derive(Debug)]
pub struct Connection {
  stream: Stream,
  options: ConnectionOptions,
  pid: Option<i32>,
  secret_key: Option<i32>,
  metadata: BTreeMap<String, String>,
}

impl Connection {
  pub async fn connect_from_url(url: &Url) -> io::Result<Self> {
    match url.scheme() {
      "postgres" | "postgresql" | "tcp" => {
        let port = url.port().unwrap_or(5432);
        let addrs = match url.host() {
          Some(url::Host::Domain(domain)) => net::lookup_host(format!("{}:{}", domain, port))
            .await
            .map(|v| v.collect::<Vec<_>>())?,
          Some(url::Host::Ipv4(ip)) => vec![SocketAddrV4::new(ip, port).into()],
          Some(url::Host::Ipv6(ip)) => vec![SocketAddrV6::new(ip, port, 0, 0).into()],
          None => vec![format!("[::]:{port}").parse().unwrap()],
        };
        let options = url.try_into()?;
        Self::connect_tcp(addrs, options).await
      }
      "unix" => {
        let options = url.try_into()?;
        Self::connect_unix(url.path(), options).await
      }
      scheme => Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{} is not supported", scheme),
      )),
    }
  }

  pub async fn connect_tcp(addrs: impl Into<Vec<SocketAddr>>, options: ConnectionOptions) -> io::Result<Self> {
    let stream = match options.connect_timeout {
      Some(connect_timeout) => tokio::time::timeout(connect_timeout, Stream::connect_tcp(addrs))
        .await
        .map_err(|_err| io::Error::new(io::ErrorKind::TimedOut, "connection timed out"))
        .and_then(|r| r),
      None => Stream::connect_tcp(addrs).await,
    }?;
    Self::connect(stream, options).await
  }

  pub async fn connect_unix(path: impl Into<PathBuf>, options: ConnectionOptions) -> io::Result<Self> {
    let stream = match options.connect_timeout {
      Some(connect_timeout) => tokio::time::timeout(connect_timeout, Stream::connect_unix(path))
        .await
        .map_err(|_err| io::Error::new(io::ErrorKind::TimedOut, "connection timed out"))
        .and_then(|r| r),
      None => Stream::connect_unix(path).await,
    }?;
    Self::connect(stream, options).await
  }

  #[cfg(feature = "ssl")]
  pub async fn connect_ssl_from_url(url: &Url, ssl_connector: openssl::ssl::SslConnector) -> io::Result<Self> {
    match url.scheme() {
      "postgres" | "postgresql" | "tcp" => {
        let options = url.try_into()?;
        let port = url.port().unwrap_or(5432);
        let (domain, addrs) = match url.host() {
          Some(url::Host::Domain(domain)) => net::lookup_host(format!("{}:{}", domain, port))
            .await
            .map(|v| (domain.to_string(), v.collect::<Vec<_>>()))?,
          Some(_) => return Err(io::Error::new(io::ErrorKind::InvalidInput, "ssl requires a domain name")),
          None => (
            "localhost".to_string(),
            vec![format!("[::]:{}", port).parse::<SocketAddr>().unwrap()],
          ),
        };
        Self::connect_ssl(addrs, domain, options, ssl_connector).await
      }
      scheme => Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{} is not supported", scheme),
      )),
    }
  }

  #[cfg(feature = "ssl")]
  pub async fn connect_ssl(
    addrs: impl Into<Vec<SocketAddr>>,
    domain: impl Into<String>,
    options: ConnectionOptions,
    ssl_connector: openssl::ssl::SslConnector,
  ) -> io::Result<Self> {
    let stream = match options.connect_timeout {
      Some(connect_timeout) => tokio::time::timeout(connect_timeout, Stream::connect_ssl(addrs, domain, ssl_connector))
        .await
        .map_err(|_err| io::Error::new(io::ErrorKind::TimedOut, "connection timed out"))
        .and_then(|r| r),
      None => Stream::connect_ssl(addrs, domain, ssl_connector).await,
    }?;
    Self::connect(stream, options).await
  }

  async fn connect(stream: Stream, options: ConnectionOptions) -> io::Result<Self> {
    let mut connection = Self {
      stream,
      options,
      pid: None,
      secret_key: None,
      metadata: BTreeMap::new(),
    };
    connection.startup().await?;
    Ok(connection)
  }

  pub async fn duplicate(&self) -> io::Result<Self> {
    let stream = self.stream_duplicate().await?;
    Self::connect(stream, self.options.clone()).await
  }

  pub async fn cancel_handle(&self) -> io::Result<CancelHandle> {
    match (self.pid, self.secret_key) {
      (Some(pid), Some(secret_key)) => {
        let stream = self.stream_duplicate().await?;
        Ok(CancelHandle {
          stream,
          secret_key,
          pid,
        })
      }
      (_, _) => Err(io::Error::new(
        io::ErrorKind::NotConnected,
        "unable to create cancel handle",
      )),
    }
  }

  async fn stream_duplicate(&self) -> io::Result<Stream> {
    match self.options.connect_timeout {
      Some(connect_timeout) => tokio::time::timeout(connect_timeout, self.stream.duplicate())
        .await
        .map_err(|_err| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))
        .and_then(|r| r),
      None => self.stream.duplicate().await,
    }
  }

  async fn stream_read_packet(&mut self) -> io::Result<(u8, Bytes)> {
    match self.options.read_timeout {
      Some(read_timeout) => tokio::time::timeout(read_timeout, self.stream.read_packet())
        .await
        .map_err(|_err| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
        .and_then(|r| r),
      None => self.stream.read_packet().await,
    }
  }

  async fn stream_flush(&mut self) -> io::Result<()> {
    match self.options.write_timeout {
      Some(write_timeout) => tokio::time::timeout(write_timeout, self.stream.flush())
        .await
        .map_err(|_err| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))
        .and_then(|r| r),
      None => self.stream.flush().await,
    }
  }

  // https://www.postgresql.org/docs/11/protocol.html
  async fn startup(&mut self) -> io::Result<()> {
    let mut params = Vec::new();
    params.push("user");
    params.push(self.options.user.as_str());
    if let Some(database) = self.options.database.as_ref() {
      params.push("database");
      params.push(database.as_str());
    }
    params.push("application_name");
    params.push("pg2bus");

    let mut len = 4 + 4 + 1;

    for p in &params {
      len += p.as_bytes().len() + 1;
    }

    self.stream.write_i32(len as i32).await?;
    self.stream.write_i32(PROTOCOL_VERSION).await?;

    for p in &params {
      self.stream.write_all(p.as_bytes()).await?;
      self.stream.write_u8(0).await?;
    }

    self.stream.write_u8(0).await?;
    self.stream_flush().await?;

    self.authenticate().await?;

    Ok(())
  }

  async fn authenticate(&mut self) -> io::Result<()> {
    loop {
      let (op, mut buffer) = self.stream_read_packet().await?;

      match op {
        b'R' => {
          match buffer.get_i32() {
            0 => break,
            2 => {
              return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "AuthenticationKerberosV5 is not supported",
              ));
            }
            3 => {
              // AuthenticationCleartextPassword
              let password = self
                .options
                .password
                .as_ref()
                .map(String::as_bytes)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "password is required"))?;

              let len = password.len() + 4 + 1;
              self.stream.write_u8(b'p').await?;
              self.stream.write_i32(len as i32).await?;
              self.stream.write_all(password).await?;
              self.stream.write_u8(0).await?;
              self.stream_flush().await?;
            }
            5 => {
              // AuthenticationMD5Password
              let password = self
                .options
                .password
                .as_ref()
                .map(String::as_bytes)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "password is required"))?;

              let mut salt = vec![0; 4];
              buffer.copy_to_slice(&mut salt);

              let mut md5 = Md5::new();
              md5.update(password);
              md5.update(self.options.user.as_bytes());
              let output = md5.finalize_reset();
              md5.update(format!("{:x}", output));
              md5.update(salt);
              let password = format!("md5{:x}", md5.finalize());

              let len = password.len() + 4 + 1;
              self.stream.write_u8(b'p').await?;
              self.stream.write_i32(len as i32).await?;
              self.stream.write_all(password.as_bytes()).await?;
              self.stream.write_u8(0).await?;
              self.stream_flush().await?
            }
            6 => {
              return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "AuthenticationSCMCredential is not supported",
              ));
            }
            7 => {
              return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "AuthenticationGSS is not supported",
              ));
            }
            9 => {
              return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "AuthenticationSSPI is not supported",
              ));
            }
            10 => {
              // https://datatracker.ietf.org/doc/html/rfc5802#section-3
              let mut mechanisms = Vec::new();
              loop {
                match buffer.pg_get_null_terminated_string()? {
                  m if m.is_empty() => break,
                  m => mechanisms.push(m),
                }
              }

              let mechanism = "SCRAM-SHA-256".to_string();

              if !mechanisms.contains(&mechanism) {
                return Err(io::Error::new(
                  io::ErrorKind::Unsupported,
                  "AuthenticationSASL SCRAM-SHA-256 is not supported upstream",
                ));
              }

              let client_nonce = thread_rng()
                .sample_iter(&Alphanumeric)
                .take(24)
                .map(char::from)
                .collect::<String>();

              let gs2_header = "n,,"; // TODO: support channel binding (SCRAM-SHA-256-PLUS)
              let cbind_data = "";
              let client_first_message = format!("{}n=,r={}", gs2_header, client_nonce);
              let len = 4 + mechanism.len() + 1 + 4 + client_first_message.len();
              self.stream.write_u8(b'p').await?;
              self.stream.write_i32(len as i32).await?;
              self.stream.write_all(mechanism.as_bytes()).await?;
              self.stream.write_u8(0).await?;
              self.stream.write_i32(client_first_message.len() as i32).await?;
              self.stream.write_all(client_first_message.as_bytes()).await?;
              self.stream_flush().await?;

              let server_first_message = self.read_sasl_response().await?;

              let mut chunks = server_first_message.splitn(3, |v| v == ',');
              let server_nonce = chunks
                .next()
                .and_then(|v| v.strip_prefix("r="))
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid nonce"))?;

              let salt: Vec<u8> = chunks
                .next()
                .and_then(|v| v.strip_prefix("s="))
                .and_then(|v| base64::decode(v).ok())
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid salt"))?;

              let iteration_count = chunks
                .next()
                .and_then(|v| v.strip_prefix("i="))
                .and_then(|v| v.parse::<usize>().ok())
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid iteration count"))?;

              fn sasl_hi(str: &[u8], salt: &[u8], i: usize) -> [u8; 32] {
                let mut prev = Hmac::<Sha256>::new_from_slice(str)
                  .unwrap()
                  .chain_update(salt)
                  .chain_update([0, 0, 0, 1])
                  .finalize()
                  .into_bytes();
                let mut hi = prev;

                for _ in 1..i {
                  prev = Hmac::<Sha256>::new_from_slice(str)
                    .unwrap()
                    .chain_update(prev)
                    .finalize()
                    .into_bytes();

                  for (hi, prev) in hi.iter_mut().zip(prev) {
                    *hi ^= prev;
                  }
                }

                hi.into()
              }

              let password = self
                .options
                .password
                .as_ref()
                .map(String::as_bytes)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "password is required"))?;

              let salted_password = sasl_hi(password, &salt, iteration_count);

              let client_key = Hmac::<Sha256>::new_from_slice(&salted_password)
                .unwrap()
                .chain_update(b"Client Key")
                .finalize()
                .into_bytes();

              let stored_key = Sha256::default().chain_update(client_key.as_slice()).finalize_fixed();

              let encoded_channel_binding = base64::encode([gs2_header, cbind_data].concat());

              let auth_message = format!(
                "n=,r={},{},c={},r={}",
                client_nonce, server_first_message, encoded_channel_binding, server_nonce
              );

              let client_signature = Hmac::<Sha256>::new_from_slice(&stored_key)
                .unwrap()
                .chain_update(auth_message.as_bytes())
                .finalize()
                .into_bytes();

              let mut client_proof = client_key;
              for (proof, signature) in client_proof.iter_mut().zip(client_signature) {
                *proof ^= signature;
              }

              let client_final_message = format!(
                "c={},r={},p={}",
                encoded_channel_binding,
                server_nonce,
                base64::encode(client_proof)
              );

              let len = 4 + client_final_message.len();
              self.stream.write_u8(b'p').await?;
              self.stream.write_i32(len as i32).await?;
              self.stream.write_all(client_final_message.as_bytes()).await?;
              self.stream_flush().await?;

              let sasl_final_response = self.read_sasl_response().await?;

              if let Some(err) = sasl_final_response.strip_prefix("e=") {
                return Err(io::Error::new(io::ErrorKind::InvalidData, err.to_string()));
              } else if let Some(verifier) = sasl_final_response.strip_prefix("v=") {
                let verifier = base64::decode(verifier)
                  .map_err(|_err| io::Error::new(io::ErrorKind::InvalidData, "failed to decode base64 sasl verifier"))?;

                let server_key = Hmac::<Sha256>::new_from_slice(&salted_password)
                  .unwrap()
                  .chain_update(b"Server Key")
                  .finalize()
                  .into_bytes();

                Hmac::<Sha256>::new_from_slice(&server_key)
                  .unwrap()
                  .chain_update(auth_message.as_bytes())
                  .verify_slice(&verifier)
                  .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "failed to verify sasl auth_message"))?;
              } else {
                return Err(io::Error::new(
                  io::ErrorKind::InvalidData,
                  "AuthenticationSASL unexpected payload",
                ));
              }
            }
            code => {
              return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unexpected backend authentication code {:?}", code),
              ))
            }
          }
        }
        b'E' => return Err(buffer.pg_get_backend_error()),
        code => {
          return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected backend message: {:?}", char::from(code)),
          ))
        }
      }
    }

    self.metadata.clear();

    loop {
      let (op, mut buffer) = self.stream_read_packet().await?;

      match op {
        b'K' => {
          self.pid.replace(buffer.get_i32());
          self.secret_key.replace(buffer.get_i32());
        }
        b'S' => {
          let key = buffer.pg_get_null_terminated_string()?;
          let value = buffer.pg_get_null_terminated_string()?;
          self.metadata.insert(key, value);
        }
        b'Z' => {
          break;
        }
        b'E' => {
          return Err(buffer.pg_get_backend_error());
        }
        b'N' => {
          tracing::warn!(notice = %buffer.pg_get_backend_notice(), "backend notice during startup");
        }
        code => {
          return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected backend message: {:?}", char::from(code)),
          ))
        }
      }
    }
    Ok(())
  }

  async fn read_sasl_response(&mut self) -> io::Result<String> {
    let (op, mut buffer) = self.stream_read_packet().await?;

    match op {
      b'R' => {
        buffer.advance(4); // skip the 11/12 SASL sub-message discriminant
        String::from_utf8(buffer.to_vec()).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
      }
      b'E' => Err(buffer.pg_get_backend_error()),
      code => Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected backend message: {:?}", char::from(code)),
      )),
    }
  }

  pub async fn ping(&mut self) -> io::Result<()> {
    self.query_first("SELECT 1").await.map(|_| ())
  }

  async fn write_query_command(&mut self, query: impl AsRef<str>) -> io::Result<()> {
    let len = query.as_ref().as_bytes().len() + 1 + 4;
    self.stream.write_u8(b'Q').await?;
    self.stream.write_i32(len as i32).await?;
    self.stream.write_all(query.as_ref().as_bytes()).await?;
    self.stream.write_u8(0).await?;
    self.stream_flush().await
  }

  pub async fn query_first(&mut self, query: impl AsRef<str>) -> io::Result<QueryResult> {
    let QueryResults { mut results, .. } = self.query(query.as_ref()).await?;
    results
      .pop_front()
      .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing query result"))
  }

  pub async fn query(&mut self, query: impl AsRef<str>) -> io::Result<QueryResults> {
    self.write_query_command(query).await?;

    // https://www.postgresql.org/docs/current/protocol-flow.html#id-1.10.6.7.4

    let mut notices: VecDeque<io::Error> = VecDeque::new();
    let mut results: VecDeque<QueryResult> = VecDeque::new();
    let mut current: Option<SelectQueryResult> = None;

    loop {
      let (op, mut buffer) = self.stream_read_packet().await?;

      match op {
        b'C' => {
          // CommandComplete
          let tag = buffer.pg_get_null_terminated_string()?;
          match current.take() {
            Some(select_query_result) => results.push_back(QueryResult::Selected(select_query_result)),
            None => match tag.rsplit_once(' ').and_then(|(_, n)| n.parse().ok()) {
              Some(n) => results.push_back(QueryResult::RowsAffected(n)),
              None => results.push_back(QueryResult::Success),
            },
          }
        }
        b'G' => return Err(io::Error::new(io::ErrorKind::Unsupported, "COPY IN is not supported")),
        b'H' => return Err(io::Error::new(io::ErrorKind::Unsupported, "COPY OUT is not supported")),
        b'T' => {
          // RowDescription
          let mut columns = Vec::new();
          let num_columns = buffer.get_i16();
          for _ in 0..num_columns {
            let name = buffer.pg_get_null_terminated_string()?;
            let oid = buffer.get_i32();
            let attr_number = buffer.get_i16();
            let datatype_oid = buffer.get_i32();
            let datatype_size = buffer.get_i16();
            let type_modifier = buffer.get_i32();
            let format = buffer.get_i16();

            columns.push(Column {
              name,
              oid,
              attr_number,
              datatype_oid,
              datatype_size,
              type_modifier,
              format,
            });
          }
          current = Some(SelectQueryResult {
            columns,
            values: Vec::new(),
          });
        }
        b'D' => {
          // DataRow
          let values = &mut current
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "data row without row description"))?
            .values;
          let num_values = buffer.get_i16();
          for _ in 0..num_values {
            let len = buffer.get_i32();

            if len > 0 {
              let value = buffer.pg_get_fixed_length_string(len.try_into().unwrap())?;
              values.push(Some(value));
            } else if len == 0 {
              values.push(Some("".to_string()));
            } else {
              values.push(None);
            }
          }
        }
        b'I' => {
          results.push_back(QueryResult::Success);
        }
        b'Z' => break,
        b'E' => match buffer.pg_get_backend_error() {
          err if err.kind() == io::ErrorKind::Other => results.push_back(QueryResult::BackendError(err)),
          err => return Err(err),
        },
        b'N' => match buffer.pg_get_backend_notice() {
          notice if notice.kind() == io::ErrorKind::Other => notices.push_back(notice),
          notice => return Err(notice),
        },
        code => {
          return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected backend message: {:?}", char::from(code)),
          ))
        }
      }
    }

    Ok(QueryResults { notices, results })
  }

  pub async fn close(mut self) -> io::Result<()> {
    self.stream.write_u8(b'X').await?;
    self.stream.write_i32(4).await?;
    self.stream.shutdown().await
  }
}
