// Copyright (c) 2026 The Trireme developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use quick_error::quick_error;

/// Environment variable that overrides the configured listen address.
pub const LISTEN_ADDR_ENV: &str = "TRIREME_ADDR";

quick_error! {
    /// Why a configuration could not be applied.
    #[derive(Debug)]
    pub enum ConfigError {
        UnknownKey(key: String) {
            display("unknown configuration key: {}", key)
        }
        InvalidValue(key: String, value: String) {
            display("invalid value for {}: {:?}", key, value)
        }
    }
}

/// Everything an engine needs to know before it binds its socket.
///
/// There is no global configuration; a `ServerConfig` is passed explicitly
/// to each engine constructor. Values usually come from `Default`, the
/// `with_*` builders, or a launcher feeding key/value pairs through
/// [`apply_pairs`](Self::apply_pairs).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Value of the auto-supplied `Server` header.
    pub server_name: String,
    /// Address to listen on, unless [`LISTEN_ADDR_ENV`] overrides it.
    pub listen_addr: SocketAddr,
    /// Listen backlog passed to the socket.
    pub backlog: u32,

    /// Initial capacity of each connection's read buffer.
    pub read_buffer_size: usize,
    /// Capacity a connection's write buffer shrinks back to after a
    /// response larger than it has been flushed.
    pub write_buffer_size: usize,
    /// Ceiling on declared request body length. Clamped to the codec's
    /// hard default.
    pub max_body_size: usize,

    /// How long a handler may take before the hybrid and event-loop
    /// engines answer 408.
    pub request_timeout: Duration,
    /// How long the threaded engine waits between keep-alive requests.
    pub idle_timeout: Duration,
    /// How long `stop()` waits for in-flight work before abandoning it.
    pub shutdown_timeout: Duration,

    /// Threaded engine: workers started upfront.
    pub core_workers: usize,
    /// Threaded engine: workers the pool may grow to.
    pub max_workers: usize,
    /// Hybrid engine: size of the blocking-friendly handler pool.
    pub io_pool_size: usize,
    /// Size of the computation pool (hybrid and event-loop engines).
    pub cpu_pool_size: usize,
    /// Hybrid engine: size of the small framing/write pool.
    pub fast_pool_size: usize,
    /// Hybrid engine: ceiling on outstanding asynchronous contexts before
    /// admission is refused with 503.
    pub max_async_contexts: usize,
    /// Event loop: external tasks run per iteration before readiness is
    /// polled again.
    pub task_drain_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            server_name: crate::SERVER_NAME.to_owned(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            backlog: 128,
            read_buffer_size: 8 * 1024,
            write_buffer_size: 16 * 1024,
            max_body_size: crate::codec::DEFAULT_MAX_BODY_SIZE,
            request_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            core_workers: 50,
            max_workers: 200,
            io_pool_size: 64,
            cpu_pool_size: num_cpus::get(),
            fast_pool_size: 4,
            max_async_contexts: 10_000,
            task_drain_limit: 1000,
        }
    }
}

impl ServerConfig {
    /// The address the engine should actually bind: the environment
    /// override when present and valid, the configured address otherwise.
    pub fn effective_addr(&self) -> Result<SocketAddr, ConfigError> {
        match env::var(LISTEN_ADDR_ENV) {
            Ok(raw) => raw.parse().map_err(|_| {
                ConfigError::InvalidValue(LISTEN_ADDR_ENV.to_owned(), raw)
            }),
            Err(_) => Ok(self.listen_addr),
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.listen_addr.set_port(port);
        self
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_async_contexts(mut self, ceiling: usize) -> Self {
        self.max_async_contexts = ceiling;
        self
    }

    /// Applies launcher-style key/value pairs. Unknown keys and unparsable
    /// values are errors; the configuration is modified in place, so apply
    /// to a scratch clone when atomicity matters.
    pub fn apply_pairs<I, K, V>(&mut self, pairs: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref());
            let invalid = || ConfigError::InvalidValue(key.to_owned(), value.to_owned());
            match key {
                "addr" => self.listen_addr = value.parse().map_err(|_| invalid())?,
                "port" => self.listen_addr.set_port(value.parse().map_err(|_| invalid())?),
                "backlog" => self.backlog = value.parse().map_err(|_| invalid())?,
                "read-buffer" => self.read_buffer_size = value.parse().map_err(|_| invalid())?,
                "write-buffer" => self.write_buffer_size = value.parse().map_err(|_| invalid())?,
                "max-body" => self.max_body_size = value.parse().map_err(|_| invalid())?,
                "request-timeout-ms" => {
                    self.request_timeout =
                        Duration::from_millis(value.parse().map_err(|_| invalid())?)
                }
                "idle-timeout-ms" => {
                    self.idle_timeout =
                        Duration::from_millis(value.parse().map_err(|_| invalid())?)
                }
                "shutdown-timeout-ms" => {
                    self.shutdown_timeout =
                        Duration::from_millis(value.parse().map_err(|_| invalid())?)
                }
                "core-workers" => self.core_workers = value.parse().map_err(|_| invalid())?,
                "max-workers" => self.max_workers = value.parse().map_err(|_| invalid())?,
                "io-pool" => self.io_pool_size = value.parse().map_err(|_| invalid())?,
                "cpu-pool" => self.cpu_pool_size = value.parse().map_err(|_| invalid())?,
                "fast-pool" => self.fast_pool_size = value.parse().map_err(|_| invalid())?,
                "max-async-contexts" => {
                    self.max_async_contexts = value.parse().map_err(|_| invalid())?
                }
                "task-drain-limit" => {
                    self.task_drain_limit = value.parse().map_err(|_| invalid())?
                }
                other => return Err(ConfigError::UnknownKey(other.to_owned())),
            }
        }
        Ok(())
    }
}
