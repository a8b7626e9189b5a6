use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use fnv::FnvHashMap;
use nanorand::{Rng, WyRand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::iriswire::auth::{AuthConfig, AuthRequest, Drive, AUTH_TIMEOUT};
use crate::iriswire::common::ErrorKind;
use crate::iriswire::config::Settings;
use crate::iriswire::iris::{Bridge, BridgeHandle, Column, ExecOutcome};
use crate::iriswire::pg::client_state::{ConnState, TxStatus};
use crate::iriswire::pg::copy::{encode_csv_row, parse_copy, CopyCommand, CopyOptions, CsvDecoder};
use crate::iriswire::pg::portal::{substitute_params, Portal, PreparedStatement};
use crate::iriswire::pg::protocol::{
    error_codes, pg_oid_for_iris_type, type_size, ErrorSeverity, Message, MessageBuilder,
    MessageErrorBuilder, MessageParser, MessageReader, StartupParams, Tag, CANCEL_REQUEST,
    GSS_ENC_REQUEST, OID_TEXT, PROTOCOL_VERSION, SSL_ALLOWED, SSL_NOT_ALLOWED, SSL_REQUEST,
};
use crate::iriswire::server::registry::{CancelRegistry, CancelToken};
use crate::iriswire::server::transport::BoxedStream;
use crate::iriswire::sql::{Translator, VectorOptimizer};
use crate::iriswire::{Error, Result};

const MAX_STARTUP_LEN: i32 = 1024 * 1024;
const COPY_CHUNK_BYTES: usize = 8 * 1024;

/// Shared construction-time dependencies threaded into every connection.
#[derive(Clone)]
pub struct ConnContext {
    pub settings: Arc<Settings>,
    pub translator: Arc<Translator>,
    pub optimizer: Arc<VectorOptimizer>,
    pub auth: Arc<AuthConfig>,
    pub bridge: Arc<Bridge>,
    pub registry: Arc<CancelRegistry>,
    pub tls: Option<TlsAcceptor>,
}

/// One client connection: protocol state machine, prepared statements,
/// portals, transaction status, COPY state. Single-consumer over its
/// socket; all cross-task interaction goes through the cancel flag.
pub struct ClientConn {
    id: u64,
    stream: BoxedStream,
    parser: MessageParser,
    out: BytesMut,
    state: ConnState,
    tx_status: TxStatus,
    backend_pid: i32,
    backend_secret: i32,
    startup: StartupParams,
    prepared: FnvHashMap<String, PreparedStatement>,
    portals: FnvHashMap<String, Portal>,
    bridge: BridgeHandle,
    ctx: ConnContext,
    cancel_flag: Arc<AtomicBool>,
    /// an extended-flow error was reported; skip messages until Sync
    extended_error: bool,
}

impl ClientConn {
    /// Entry point for one accepted socket: SSL/cancel probe, startup,
    /// authentication, then the message loop until the peer goes away.
    pub async fn run(
        id: u64,
        tcp: TcpStream,
        ctx: ConnContext,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut stream: BoxedStream = Box::new(tcp);
        let mut probes = 0u32;
        let (startup_len, protocol) = loop {
            let mut head = [0u8; 8];
            stream.read_exact(&mut head).await?;
            let len = i32::from_be_bytes(head[0..4].try_into()?);
            let code = i32::from_be_bytes(head[4..8].try_into()?);

            if len == 16 && code == CANCEL_REQUEST {
                // transient cancel connection: no bytes are ever sent back
                let mut rest = [0u8; 8];
                stream.read_exact(&mut rest).await?;
                let pid = i32::from_be_bytes(rest[0..4].try_into()?);
                let secret = i32::from_be_bytes(rest[4..8].try_into()?);
                ctx.registry.cancel(pid, secret, &ctx.bridge);
                return Ok(());
            }
            probes += 1;
            if probes > 4 {
                return Err(Error::protocol_error("too many negotiation probes"));
            }
            if len == 8 && code == SSL_REQUEST {
                match &ctx.tls {
                    Some(acceptor) => {
                        stream.write_all(&[SSL_ALLOWED]).await?;
                        stream.flush().await?;
                        let acceptor: TlsAcceptor = acceptor.clone();
                        stream = Box::new(acceptor.accept(stream).await?);
                        debug!(id, "connection upgraded to TLS");
                    }
                    None => {
                        stream.write_all(&[SSL_NOT_ALLOWED]).await?;
                        stream.flush().await?;
                    }
                }
                continue;
            }
            if len == 8 && code == GSS_ENC_REQUEST {
                stream.write_all(&[SSL_NOT_ALLOWED]).await?;
                stream.flush().await?;
                continue;
            }
            break (len, code);
        };

        if protocol != PROTOCOL_VERSION {
            let msg = MessageErrorBuilder::new(
                ErrorSeverity::Fatal,
                error_codes::PROTOCOL_VIOLATION,
                &format!("unsupported protocol version {:08x}", protocol),
            )
            .finish();
            let _ = stream.write_all(&msg).await;
            return Err(Error::protocol_error("unsupported protocol version"));
        }
        if !(8..=MAX_STARTUP_LEN).contains(&startup_len) {
            return Err(Error::protocol_error("implausible startup message length"));
        }
        let mut body = vec![0u8; (startup_len - 8) as usize];
        stream.read_exact(&mut body).await?;
        let startup = StartupParams::parse(&body)?;

        let mut rng = WyRand::new();
        let backend_pid = 1000 + (rng.generate::<u32>() % 31768) as i32;
        let backend_secret = rng.generate::<u32>() as i32;

        let mut conn = ClientConn {
            id,
            stream,
            parser: MessageParser::new(ctx.settings.recv_buffer_size as usize),
            out: BytesMut::with_capacity(4096),
            state: ConnState::Startup,
            tx_status: TxStatus::Idle,
            backend_pid,
            backend_secret,
            startup,
            prepared: FnvHashMap::default(),
            portals: FnvHashMap::default(),
            bridge: BridgeHandle::new(ctx.bridge.clone(), id),
            ctx,
            cancel_flag: Arc::new(AtomicBool::new(false)),
            extended_error: false,
        };

        let result = conn.serve(&mut shutdown).await;
        conn.ctx.registry.unregister(conn.backend_pid);
        conn.state.transition(ConnState::Terminated)?;
        match &result {
            Err(e) if !matches!(e.kind(), ErrorKind::ClosedError | ErrorKind::IOError(_)) => {
                warn!(id = conn.id, %e, "connection ended with error");
            }
            _ => debug!(id = conn.id, "connection closed"),
        }
        result
    }

    async fn serve(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        self.state.transition(ConnState::Authenticating)?;
        match tokio::time::timeout(AUTH_TIMEOUT, self.authenticate()).await {
            Ok(Ok(user)) => {
                info!(id = self.id, %user, database = self.startup.database(),
                      "client authenticated");
            }
            Ok(Err(e)) => {
                self.write_error(ErrorSeverity::Fatal, &e);
                let _ = self.flush().await;
                return Err(e);
            }
            Err(_) => {
                let e = Error::auth_failed("authentication timed out");
                self.write_error(ErrorSeverity::Fatal, &e);
                let _ = self.flush().await;
                return Err(e);
            }
        }
        self.state.transition(ConnState::Ready)?;

        self.ctx.registry.register(
            self.backend_pid,
            CancelToken {
                secret: self.backend_secret,
                key: self.id,
                flag: self.cancel_flag.clone(),
            },
        );
        self.send_startup_response().await?;
        self.message_loop(shutdown).await
    }

    async fn message_loop(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        loop {
            let msg = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_ok() && !*shutdown.borrow() {
                        continue;
                    }
                    if changed.is_ok() {
                        let e = Error::sql(
                            error_codes::ADMIN_SHUTDOWN,
                            "terminating connection due to administrator command",
                        );
                        self.write_error(ErrorSeverity::Fatal, &e);
                        let _ = self.flush().await;
                    }
                    return Ok(());
                }
                msg = Self::next_message(&mut self.stream, &mut self.parser) => msg?,
            };
            match msg.tag() {
                Tag::TERMINATE => {
                    debug!(id = self.id, "client terminated connection");
                    return Ok(());
                }
                Tag::QUERY => self.simple_query(&msg).await?,
                Tag::PARSE
                | Tag::BIND
                | Tag::DESCRIBE
                | Tag::EXECUTE
                | Tag::CLOSE
                | Tag::FLUSH
                | Tag::SYNC => self.extended(&msg).await?,
                Tag::COPY_DATA | Tag::COPY_DONE | Tag::COPY_FAIL => {
                    // COPY messages outside a COPY operation are dropped,
                    // matching backend behavior for a failed COPY
                    debug!(id = self.id, tag = %msg.tag(), "ignoring COPY message outside COPY mode");
                }
                Tag::PASSWORD_MESSAGE => {
                    return Err(Error::protocol_error(
                        "unexpected password message after authentication",
                    ));
                }
                other => {
                    let e = Error::sql(
                        error_codes::FEATURE_NOT_SUPPORTED,
                        format!("message {} is not supported", other),
                    );
                    self.write_error(ErrorSeverity::Error, &e);
                    self.write_ready_for_query();
                    self.flush().await?;
                }
            }
        }
    }

    async fn next_message(stream: &mut BoxedStream, parser: &mut MessageParser) -> Result<Message> {
        loop {
            if let Some(msg) = parser.next()? {
                return Ok(msg);
            }
            let n = stream.read_buf(parser.bytes_mut()).await?;
            if n == 0 {
                return Err(Error::closed());
            }
        }
    }

    async fn read_message(&mut self) -> Result<Message> {
        Self::next_message(&mut self.stream, &mut self.parser).await
    }

    // --- outbound plumbing ---

    fn queue(&mut self, bytes: Bytes) {
        self.out.extend_from_slice(&bytes);
    }

    async fn flush(&mut self) -> Result<()> {
        if self.out.is_empty() {
            return Ok(());
        }
        let buf = self.out.split().freeze();
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    fn write_ready_for_query(&mut self) {
        let mut mb = MessageBuilder::new(Tag::READY_FOR_QUERY);
        mb.write_byte(self.tx_status.as_byte());
        let msg = mb.finish();
        self.queue(msg);
    }

    fn write_error(&mut self, severity: ErrorSeverity, err: &Error) {
        let msg = MessageErrorBuilder::new(severity, err.sqlstate(), &err.to_string()).finish();
        self.queue(msg);
    }

    fn write_notice(&mut self, text: &str) {
        let msg = MessageErrorBuilder::new(ErrorSeverity::Notice, error_codes::WARNING, text).finish();
        self.queue(msg);
    }

    fn write_command_complete(&mut self, tag: &str) {
        let mut mb = MessageBuilder::new(Tag::COMMAND_COMPLETE);
        mb.write_str(tag);
        let msg = mb.finish();
        self.queue(msg);
    }

    fn write_row_description(&mut self, columns: &[Column]) {
        let mut mb = MessageBuilder::new(Tag::ROW_DESCRIPTION);
        mb.write_i16(columns.len() as i16);
        for col in columns {
            let oid = pg_oid_for_iris_type(&col.iris_type);
            mb.write_str(&col.name);
            mb.write_i32(0); // table oid
            mb.write_i16(0); // column attribute number
            mb.write_i32(oid);
            mb.write_i16(type_size(oid));
            mb.write_i32(-1); // type modifier
            mb.write_i16(0); // text format
        }
        let msg = mb.finish();
        self.queue(msg);
    }

    fn write_data_row(&mut self, row: &[Option<String>]) {
        let mut mb = MessageBuilder::new(Tag::DATA_ROW);
        mb.write_i16(row.len() as i16);
        for value in row {
            match value {
                None => mb.write_i32(-1),
                Some(v) => {
                    mb.write_i32(v.len() as i32);
                    mb.write_bytes(v.as_bytes());
                }
            }
        }
        let msg = mb.finish();
        self.queue(msg);
    }

    // --- startup & authentication ---

    fn write_auth_request(&mut self, request: &AuthRequest) {
        let mut mb = MessageBuilder::new(Tag::AUTHENTICATION);
        match request {
            AuthRequest::CleartextPassword => mb.write_i32(3),
            AuthRequest::Gss => mb.write_i32(7),
            AuthRequest::GssContinue(data) => {
                mb.write_i32(8);
                mb.write_bytes(data);
            }
            AuthRequest::SaslMechanisms(mechanisms) => {
                mb.write_i32(10);
                for mechanism in mechanisms {
                    mb.write_str(mechanism);
                }
                mb.write_byte(0);
            }
            AuthRequest::SaslContinue(data) => {
                mb.write_i32(11);
                mb.write_bytes(data);
            }
            AuthRequest::SaslFinal(data) => {
                mb.write_i32(12);
                mb.write_bytes(data);
            }
        }
        let msg = mb.finish();
        self.queue(msg);
    }

    async fn authenticate(&mut self) -> Result<String> {
        let mut authenticator = self.ctx.auth.authenticator(self.startup.user())?;
        let mut drive = authenticator.start()?;
        loop {
            match drive {
                Drive::Send(request) => {
                    self.write_auth_request(&request);
                    self.flush().await?;
                    let msg = self.read_message().await?;
                    if msg.tag() != Tag::PASSWORD_MESSAGE {
                        return Err(Error::protocol_error(format!(
                            "expected password message during authentication, got {}",
                            msg.tag()
                        )));
                    }
                    drive = authenticator.drive(msg.body())?;
                }
                Drive::Finish {
                    outcome,
                    final_message,
                } => {
                    if outcome.verify_exists && !self.bridge.user_exists(&outcome.user).await? {
                        return Err(Error::auth_failed(format!(
                            "user \"{}\" does not exist in IRIS",
                            outcome.user
                        )));
                    }
                    if let Some(request) = final_message {
                        self.write_auth_request(&request);
                    }
                    // AuthenticationOk
                    let mut mb = MessageBuilder::new(Tag::AUTHENTICATION);
                    mb.write_i32(0);
                    let msg = mb.finish();
                    self.queue(msg);
                    return Ok(outcome.user);
                }
            }
        }
    }

    async fn send_startup_response(&mut self) -> Result<()> {
        let app_name = self.startup.application_name().to_string();
        let params: [(&str, &str); 11] = [
            ("server_version", "16.0 (InterSystems IRIS)"),
            ("server_version_num", "160000"),
            ("server_encoding", "UTF8"),
            ("client_encoding", "UTF8"),
            ("DateStyle", "ISO, MDY"),
            ("TimeZone", "UTC"),
            ("integer_datetimes", "on"),
            ("standard_conforming_strings", "on"),
            ("IntervalStyle", "postgres"),
            ("is_superuser", "off"),
            ("application_name", &app_name),
        ];
        for (key, value) in params {
            let mut mb = MessageBuilder::new(Tag::PARAMETER_STATUS);
            mb.write_str(key);
            mb.write_str(value);
            let msg = mb.finish();
            self.queue(msg);
        }
        let mut mb = MessageBuilder::new(Tag::BACKEND_KEY_DATA);
        mb.write_i32(self.backend_pid);
        mb.write_i32(self.backend_secret);
        let msg = mb.finish();
        self.queue(msg);
        self.write_ready_for_query();
        self.flush().await
    }

    // --- simple query flow ---

    async fn simple_query(&mut self, msg: &Message) -> Result<()> {
        self.state.transition(ConnState::SimpleQuery)?;
        let mut reader = MessageReader::new(msg);
        let sql = match reader.read_str() {
            Ok(s) => s.to_string(),
            // some drivers omit the terminator on the last byte
            Err(_) => String::from_utf8_lossy(msg.body()).into_owned(),
        };
        debug!(id = self.id, sql = %truncate_for_log(&sql), "query received");

        let statements: Vec<String> = crate::iriswire::sql::tokenizer::split_statements(&sql)
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        if statements.is_empty() {
            let msg = MessageBuilder::new(Tag::EMPTY_QUERY_RESPONSE).finish();
            self.queue(msg);
            self.write_ready_for_query();
            self.flush().await?;
            self.state.transition(ConnState::Ready)?;
            return Ok(());
        }

        for statement in statements {
            match self.run_statement(&statement).await {
                Ok(()) => (),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.report_query_error(&e);
                    break;
                }
            }
        }
        self.write_ready_for_query();
        self.flush().await?;
        if self.state != ConnState::SimpleQuery {
            // COPY moved us; it restores SimpleQuery before returning
            return Err(Error::protocol_error("inconsistent state after statement"));
        }
        self.state.transition(ConnState::Ready)?;
        Ok(())
    }

    fn report_query_error(&mut self, e: &Error) {
        if self.tx_status == TxStatus::InTransaction {
            self.tx_status = TxStatus::FailedTransaction;
        }
        self.write_error(ErrorSeverity::Error, e);
    }

    async fn run_statement(&mut self, sql: &str) -> Result<()> {
        let first = first_keyword(sql);

        // a failed transaction only accepts ROLLBACK / COMMIT
        if self.tx_status == TxStatus::FailedTransaction
            && !matches!(first.as_str(), "ROLLBACK" | "COMMIT" | "END" | "ABORT")
        {
            return Err(Error::sql(
                error_codes::IN_FAILED_SQL_TRANSACTION,
                "current transaction is aborted, commands ignored until end of transaction block",
            ));
        }

        match first.as_str() {
            "BEGIN" | "START" => return self.transaction_begin().await,
            "COMMIT" | "END" => return self.transaction_commit().await,
            "ROLLBACK" | "ABORT" if !sql.to_ascii_uppercase().contains(" TO ") => {
                return self.transaction_rollback().await
            }
            "COPY" => {
                if let Some(command) = parse_copy(sql)? {
                    return self.copy(command).await;
                }
            }
            _ => (),
        }

        let translation = self.ctx.translator.translate(sql)?;
        for warning in &translation.warnings {
            self.write_notice(warning);
        }
        let translated = translation.translated_sql.clone();
        let outcome = self.execute_bridge(translated, Vec::new()).await?;
        self.respond_result(&outcome, &first, true).await
    }

    async fn transaction_begin(&mut self) -> Result<()> {
        if self.tx_status == TxStatus::InTransaction {
            self.write_notice("there is already a transaction in progress");
        } else {
            let r = self.bridge.begin().await;
            self.check_canceled(r)?;
            self.tx_status = TxStatus::InTransaction;
        }
        self.write_command_complete("BEGIN");
        Ok(())
    }

    async fn transaction_commit(&mut self) -> Result<()> {
        let tag = match self.tx_status {
            TxStatus::Idle => {
                self.write_notice("there is no transaction in progress");
                "COMMIT"
            }
            TxStatus::InTransaction => {
                let r = self.bridge.commit().await;
                self.check_canceled(r)?;
                "COMMIT"
            }
            // commit of a failed transaction rolls back
            TxStatus::FailedTransaction => {
                let r = self.bridge.rollback().await;
                self.check_canceled(r)?;
                "ROLLBACK"
            }
        };
        self.tx_status = TxStatus::Idle;
        self.write_command_complete(tag);
        Ok(())
    }

    async fn transaction_rollback(&mut self) -> Result<()> {
        if self.tx_status == TxStatus::Idle {
            self.write_notice("there is no transaction in progress");
        } else {
            let r = self.bridge.rollback().await;
            self.check_canceled(r)?;
        }
        self.tx_status = TxStatus::Idle;
        self.write_command_complete("ROLLBACK");
        Ok(())
    }

    /// Run SQL through the bridge, surfacing a processed CancelRequest as
    /// SQLSTATE 57014 at this boundary.
    async fn execute_bridge(
        &mut self,
        sql: String,
        params: Vec<Option<String>>,
    ) -> Result<ExecOutcome> {
        let result = self.bridge.execute(sql, params).await;
        self.check_canceled(result)
    }

    fn check_canceled<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Ok(v) => {
                self.cancel_flag.store(false, Ordering::SeqCst);
                Ok(v)
            }
            Err(_) if self.cancel_flag.swap(false, Ordering::SeqCst) => {
                Err(Error::query_canceled())
            }
            Err(e) => Err(e),
        }
    }

    /// RowDescription (optional) + DataRows with back-pressure +
    /// CommandComplete.
    async fn respond_result(
        &mut self,
        outcome: &ExecOutcome,
        first_word: &str,
        send_row_description: bool,
    ) -> Result<()> {
        let has_columns = !outcome.columns.is_empty();
        if has_columns && send_row_description {
            let columns = outcome.columns.clone();
            self.write_row_description(&columns);
        }
        let mut sent = 0u64;
        if has_columns {
            let batch = self.ctx.settings.result_batch_size as u64;
            let highwater = self.ctx.settings.write_highwater;
            for row in &outcome.rows {
                self.write_data_row(row);
                sent += 1;
                // flush at row-count and byte milestones, yielding so one
                // huge result set cannot starve other connections
                if sent % batch == 0 || self.out.len() >= highwater {
                    self.flush().await?;
                    tokio::task::yield_now().await;
                }
            }
        }
        let tag = command_tag(first_word, has_columns.then_some(sent), outcome.affected);
        self.write_command_complete(&tag);
        Ok(())
    }

    // --- extended query flow ---

    async fn extended(&mut self, msg: &Message) -> Result<()> {
        if self.state == ConnState::Ready {
            self.state.transition(ConnState::Extended)?;
        }
        if self.extended_error && !matches!(msg.tag(), Tag::SYNC | Tag::FLUSH) {
            return Ok(());
        }
        let result = match msg.tag() {
            Tag::PARSE => self.handle_parse(msg),
            Tag::BIND => self.handle_bind(msg),
            Tag::DESCRIBE => self.handle_describe(msg),
            Tag::EXECUTE => self.handle_execute(msg).await,
            Tag::CLOSE => self.handle_close(msg),
            Tag::FLUSH => {
                self.flush().await?;
                return Ok(());
            }
            Tag::SYNC => {
                self.extended_error = false;
                self.write_ready_for_query();
                self.flush().await?;
                self.state.transition(ConnState::Ready)?;
                return Ok(());
            }
            _ => unreachable!("extended() dispatch covers its tags"),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.report_query_error(&e);
                self.extended_error = true;
                self.flush().await?;
                Ok(())
            }
        }
    }

    fn handle_parse(&mut self, msg: &Message) -> Result<()> {
        let mut r = MessageReader::new(msg);
        let name = r.read_str()?.to_string();
        let sql = r.read_str()?.to_string();
        let n_param_types = r.read_i16();
        let mut param_oids = Vec::with_capacity(n_param_types.max(0) as usize);
        for _ in 0..n_param_types {
            param_oids.push(r.read_i32());
        }
        r.error()?;

        let translation = self.ctx.translator.translate(&sql)?;
        debug!(id = self.id, statement = %name, constructs = translation.mappings.len(),
               cache_hit = translation.metrics.cache_hit, "statement parsed");
        self.prepared.insert(
            name,
            PreparedStatement {
                original_sql: sql,
                translated_sql: translation.translated_sql.clone(),
                param_oids,
                warnings: translation.warnings.clone(),
            },
        );
        let msg = MessageBuilder::new(Tag::PARSE_COMPLETE).finish();
        self.queue(msg);
        Ok(())
    }

    fn handle_bind(&mut self, msg: &Message) -> Result<()> {
        let mut r = MessageReader::new(msg);
        let portal_name = r.read_str()?.to_string();
        let statement_name = r.read_str()?.to_string();

        let n_formats = r.read_i16().max(0) as usize;
        let mut formats = Vec::with_capacity(n_formats);
        for _ in 0..n_formats {
            formats.push(r.read_i16());
        }
        let statement = self.prepared.get(&statement_name).ok_or_else(|| {
            Error::sql(
                error_codes::INVALID_SQL_STATEMENT_NAME,
                format!("prepared statement \"{}\" does not exist", statement_name),
            )
        })?;

        let n_params = r.read_i16().max(0) as usize;
        let mut params = Vec::with_capacity(n_params);
        for i in 0..n_params {
            let len = r.read_i32();
            let value = if len < 0 {
                None
            } else {
                let bytes = r.read_bytes(len as usize)?;
                let format = formats
                    .get(i)
                    .or_else(|| formats.first())
                    .copied()
                    .unwrap_or(0);
                if format == 0 {
                    Some(std::str::from_utf8(bytes)?.to_string())
                } else {
                    let oid = statement.param_oids.get(i).copied().unwrap_or(0);
                    Some(decode_binary_param(oid, bytes)?)
                }
            };
            params.push(value);
        }
        let n_result_formats = r.read_i16().max(0) as usize;
        let mut result_formats = Vec::with_capacity(n_result_formats);
        for _ in 0..n_result_formats {
            result_formats.push(r.read_i16());
        }
        r.error()?;

        // all values go back to the client in text format
        if result_formats.iter().any(|&f| f != 0) {
            return Err(Error::sql(
                error_codes::FEATURE_NOT_SUPPORTED,
                "binary result format is not supported",
            ));
        }

        self.portals.insert(
            portal_name,
            Portal {
                statement: statement_name,
                params,
                result_formats,
                describe_requested: false,
            },
        );
        let msg = MessageBuilder::new(Tag::BIND_COMPLETE).finish();
        self.queue(msg);
        Ok(())
    }

    fn handle_describe(&mut self, msg: &Message) -> Result<()> {
        let mut r = MessageReader::new(msg);
        let kind = r.read_byte();
        let name = r.read_str()?.to_string();
        match kind {
            b'S' => {
                let statement = self.prepared.get(&name).ok_or_else(|| {
                    Error::sql(
                        error_codes::INVALID_SQL_STATEMENT_NAME,
                        format!("prepared statement \"{}\" does not exist", name),
                    )
                })?;
                let mut mb = MessageBuilder::new(Tag::PARAMETER_DESCRIPTION);
                mb.write_i16(statement.param_oids.len() as i16);
                for oid in &statement.param_oids {
                    // unspecified parameter types are described as text
                    mb.write_i32(if *oid == 0 { OID_TEXT } else { *oid });
                }
                // the result shape is only known at Execute; see NoData note
                mb.add_new(Tag::NO_DATA);
                let msg = mb.finish();
                self.queue(msg);
            }
            b'P' => {
                let portal = self.portals.get_mut(&name).ok_or_else(|| {
                    Error::sql(
                        error_codes::INVALID_CURSOR_NAME,
                        format!("portal \"{}\" does not exist", name),
                    )
                })?;
                // RowDescription is emitted by Execute, ahead of the rows
                portal.describe_requested = true;
            }
            other => {
                return Err(Error::protocol_error(format!(
                    "bad describe kind '{}'",
                    other as char
                )))
            }
        }
        Ok(())
    }

    async fn handle_execute(&mut self, msg: &Message) -> Result<()> {
        let mut r = MessageReader::new(msg);
        let portal_name = r.read_str()?.to_string();
        let _max_rows = r.read_i32(); // fetch-all; see PortalSuspended note

        let portal = self.portals.get(&portal_name).ok_or_else(|| {
            Error::sql(
                error_codes::INVALID_CURSOR_NAME,
                format!("portal \"{}\" does not exist", portal_name),
            )
        })?;
        let statement = self.prepared.get(&portal.statement).ok_or_else(|| {
            Error::sql(
                error_codes::INVALID_SQL_STATEMENT_NAME,
                format!("prepared statement \"{}\" does not exist", portal.statement),
            )
        })?;
        let describe_requested = portal.describe_requested;
        let params = portal.params.clone();
        let translated = statement.translated_sql.clone();
        let warnings = statement.warnings.clone();
        let first = first_keyword(&statement.original_sql);

        if self.tx_status == TxStatus::FailedTransaction {
            return Err(Error::sql(
                error_codes::IN_FAILED_SQL_TRANSACTION,
                "current transaction is aborted, commands ignored until end of transaction block",
            ));
        }
        for warning in &warnings {
            self.write_notice(warning);
        }

        // intercepted transaction verbs work through the extended flow too
        match first.as_str() {
            "BEGIN" | "START" => return self.transaction_begin().await,
            "COMMIT" | "END" => return self.transaction_commit().await,
            "ROLLBACK" | "ABORT" => return self.transaction_rollback().await,
            _ => (),
        }

        // inline literal vectors ahead of substitution so the HNSW index
        // stays usable, then inline the remaining bound values
        let optimized = self.ctx.optimizer.optimize(&translated, params);
        let final_sql = substitute_params(&optimized.sql, &optimized.params)?;
        let outcome = self.execute_bridge(final_sql, Vec::new()).await?;
        if describe_requested && outcome.columns.is_empty() {
            let msg = MessageBuilder::new(Tag::NO_DATA).finish();
            self.queue(msg);
        }
        self.respond_result(&outcome, &first, describe_requested).await?;
        self.flush().await
    }

    fn handle_close(&mut self, msg: &Message) -> Result<()> {
        let mut r = MessageReader::new(msg);
        let kind = r.read_byte();
        let name = r.read_str()?;
        match kind {
            b'S' => {
                self.prepared.remove(name);
            }
            b'P' => {
                self.portals.remove(name);
            }
            other => {
                return Err(Error::protocol_error(format!(
                    "bad close kind '{}'",
                    other as char
                )))
            }
        }
        let msg = MessageBuilder::new(Tag::CLOSE_COMPLETE).finish();
        self.queue(msg);
        Ok(())
    }

    // --- COPY subprotocol ---

    async fn copy(&mut self, command: CopyCommand) -> Result<()> {
        match command {
            CopyCommand::In {
                table,
                columns,
                options,
            } => self.copy_in(table, columns, options).await,
            CopyCommand::Out {
                table,
                columns,
                query,
                options,
            } => self.copy_out(table, columns, query, options).await,
        }
    }

    async fn copy_in(
        &mut self,
        table: String,
        columns: Vec<String>,
        options: CopyOptions,
    ) -> Result<()> {
        self.state.transition(ConnState::CopyIn)?;
        let column_count = if columns.is_empty() { 1 } else { columns.len() };
        let mut mb = MessageBuilder::new(Tag::COPY_IN_RESPONSE);
        mb.write_byte(0); // overall text format
        mb.write_i16(column_count as i16);
        for _ in 0..column_count {
            mb.write_i16(0);
        }
        let msg = mb.finish();
        self.queue(msg);
        self.flush().await?;

        let batch_rows = self.ctx.settings.copy_batch_rows;
        let buffer_cap = self.ctx.settings.copy_buffer_bytes;
        let mut decoder = CsvDecoder::new(
            options,
            if columns.is_empty() {
                None
            } else {
                Some(columns.len())
            },
        );
        let mut pending: Vec<Vec<Option<String>>> = Vec::new();
        let mut total = 0u64;
        let mut failure: Option<Error> = None;

        let result: Result<u64> = loop {
            let msg = self.read_message().await?;
            match msg.tag() {
                Tag::COPY_DATA => {
                    if failure.is_some() {
                        continue; // drain until the client finishes the COPY
                    }
                    decoder.push(msg.body());
                    match decoder.drain_rows() {
                        Ok(rows) => pending.extend(rows),
                        Err(e) => {
                            pending.clear();
                            failure = Some(e);
                            continue;
                        }
                    }
                    // back-pressure: the insert below blocks this task, so
                    // no further CopyData is read until the batch drains
                    while pending.len() >= batch_rows {
                        let batch: Vec<_> = pending.drain(..batch_rows).collect();
                        match self.insert_copy_batch(&table, &columns, batch).await {
                            Ok(n) => total += n,
                            Err(e) => {
                                pending.clear();
                                failure = Some(e);
                                break;
                            }
                        }
                    }
                    if failure.is_none() && decoder.buffered_len() > buffer_cap {
                        // a single unterminated row larger than the cap
                        pending.clear();
                        failure = Some(Error::sql(
                            error_codes::OUT_OF_MEMORY,
                            "COPY buffered data exceeds the configured limit",
                        ));
                    }
                    if failure.is_none() && !pending.is_empty() {
                        // partial-batch flush once memory pressure builds
                        let pending_bytes: usize = pending
                            .iter()
                            .flatten()
                            .map(|v| v.as_ref().map(|s| s.len()).unwrap_or(0) + 8)
                            .sum();
                        if pending_bytes > buffer_cap {
                            let batch = std::mem::take(&mut pending);
                            match self.insert_copy_batch(&table, &columns, batch).await {
                                Ok(n) => total += n,
                                Err(e) => failure = Some(e),
                            }
                        }
                    }
                }
                Tag::COPY_DONE => {
                    if let Some(e) = failure.take() {
                        break Err(e);
                    }
                    match decoder.finish() {
                        Ok(rows) => pending.extend(rows),
                        Err(e) => break Err(e),
                    }
                    if !pending.is_empty() {
                        let batch = std::mem::take(&mut pending);
                        match self.insert_copy_batch(&table, &columns, batch).await {
                            Ok(n) => total += n,
                            Err(e) => break Err(e),
                        }
                    }
                    break Ok(total);
                }
                Tag::COPY_FAIL => {
                    let mut r = MessageReader::new(&msg);
                    let reason = r.read_str().unwrap_or("no reason given").to_string();
                    break Err(Error::sql(
                        error_codes::QUERY_CANCELED,
                        format!("COPY from stdin failed: {}", reason),
                    ));
                }
                Tag::FLUSH | Tag::SYNC => (), // legal no-ops during COPY
                Tag::TERMINATE => return Err(Error::closed()),
                other => {
                    break Err(Error::protocol_error(format!(
                        "unexpected message {} during COPY FROM STDIN",
                        other
                    )))
                }
            }
        };
        self.state.transition(ConnState::SimpleQuery)?;
        match result {
            Ok(total) => {
                self.write_command_complete(&format!("COPY {}", total));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn insert_copy_batch(
        &mut self,
        table: &str,
        columns: &[String],
        batch: Vec<Vec<Option<String>>>,
    ) -> Result<u64> {
        let Some(width) = batch.first().map(|row| row.len()) else {
            return Ok(0);
        };
        let placeholders = vec!["?"; width].join(", ");
        let sql = if columns.is_empty() {
            format!("INSERT INTO {} VALUES ({})", table, placeholders)
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                columns.join(", "),
                placeholders
            )
        };
        let result = self.bridge.execute_many(sql, batch).await;
        self.check_canceled(result)
    }

    async fn copy_out(
        &mut self,
        table: String,
        columns: Vec<String>,
        query: Option<String>,
        options: CopyOptions,
    ) -> Result<()> {
        let sql = match query {
            Some(q) => self.ctx.translator.translate(&q)?.translated_sql.clone(),
            None if columns.is_empty() => format!("SELECT * FROM {}", table),
            None => format!("SELECT {} FROM {}", columns.join(", "), table),
        };
        let outcome = self.execute_bridge(sql, Vec::new()).await?;

        self.state.transition(ConnState::CopyOut)?;
        let mut mb = MessageBuilder::new(Tag::COPY_OUT_RESPONSE);
        mb.write_byte(0);
        mb.write_i16(outcome.columns.len() as i16);
        for _ in 0..outcome.columns.len() {
            mb.write_i16(0);
        }
        let msg = mb.finish();
        self.queue(msg);

        if options.header {
            let header: Vec<Option<String>> = outcome
                .columns
                .iter()
                .map(|c| Some(c.name.clone()))
                .collect();
            self.write_copy_data(encode_csv_row(&header, &options).as_bytes());
        }

        let mut chunk = String::new();
        let mut total = 0u64;
        for row in &outcome.rows {
            chunk.push_str(&encode_csv_row(row, &options));
            total += 1;
            if chunk.len() >= COPY_CHUNK_BYTES {
                let bytes = std::mem::take(&mut chunk);
                self.write_copy_data(bytes.as_bytes());
                if self.out.len() >= self.ctx.settings.write_highwater {
                    self.flush().await?;
                    tokio::task::yield_now().await;
                }
            }
        }
        if !chunk.is_empty() {
            self.write_copy_data(chunk.as_bytes());
        }
        let msg = MessageBuilder::new(Tag::COPY_DONE).finish();
        self.queue(msg);
        self.state.transition(ConnState::SimpleQuery)?;
        self.write_command_complete(&format!("COPY {}", total));
        Ok(())
    }

    fn write_copy_data(&mut self, data: &[u8]) {
        let mut mb = MessageBuilder::new(Tag::COPY_DATA);
        mb.write_bytes(data);
        let msg = mb.finish();
        self.queue(msg);
    }
}

fn first_keyword(sql: &str) -> String {
    use crate::iriswire::sql::tokenizer::{tokenize, TokenKind};
    for tok in tokenize(sql) {
        if tok.kind == TokenKind::Word {
            return tok.text(sql).to_ascii_uppercase();
        }
        if !matches!(
            tok.kind,
            TokenKind::Whitespace | TokenKind::LineComment | TokenKind::BlockComment
        ) {
            break;
        }
    }
    String::new()
}

/// CommandComplete tag per command. Row-returning statements report the
/// number of rows sent; DML reports the bridge's affected-row count.
fn command_tag(first_word: &str, rows_sent: Option<u64>, affected: u64) -> String {
    match first_word {
        "SELECT" | "VALUES" | "SHOW" | "WITH" => format!("SELECT {}", rows_sent.unwrap_or(0)),
        "INSERT" => format!("INSERT 0 {}", affected),
        "UPDATE" => format!("UPDATE {}", affected),
        "DELETE" => format!("DELETE {}", affected),
        "CREATE" | "DROP" | "ALTER" | "BEGIN" | "COMMIT" | "ROLLBACK" => first_word.to_string(),
        "COPY" => format!("COPY {}", affected),
        "" => format!("SELECT {}", rows_sent.unwrap_or(0)),
        other => match rows_sent {
            Some(n) => format!("SELECT {}", n),
            None => other.to_string(),
        },
    }
}

fn decode_binary_param(oid: i32, bytes: &[u8]) -> Result<String> {
    let value = match oid {
        21 if bytes.len() == 2 => i16::from_be_bytes(bytes.try_into()?).to_string(),
        23 if bytes.len() == 4 => i32::from_be_bytes(bytes.try_into()?).to_string(),
        20 if bytes.len() == 8 => i64::from_be_bytes(bytes.try_into()?).to_string(),
        700 if bytes.len() == 4 => f32::from_be_bytes(bytes.try_into()?).to_string(),
        701 if bytes.len() == 8 => f64::from_be_bytes(bytes.try_into()?).to_string(),
        16 if bytes.len() == 1 => (if bytes[0] != 0 { "1" } else { "0" }).to_string(),
        // everything else is hex-escaped
        _ => format!("\\x{}", hex::encode(bytes)),
    };
    Ok(value)
}

fn truncate_for_log(sql: &str) -> &str {
    let max = 120.min(sql.len());
    // stay on a char boundary
    let mut end = max;
    while !sql.is_char_boundary(end) {
        end -= 1;
    }
    &sql[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_tags() {
        assert_eq!(command_tag("SELECT", Some(5), 0), "SELECT 5");
        assert_eq!(command_tag("INSERT", None, 3), "INSERT 0 3");
        assert_eq!(command_tag("UPDATE", None, 2), "UPDATE 2");
        assert_eq!(command_tag("DELETE", None, 1), "DELETE 1");
        assert_eq!(command_tag("CREATE", None, 0), "CREATE");
        assert_eq!(command_tag("COPY", None, 7), "COPY 7");
    }

    #[test]
    fn test_first_keyword_skips_comments() {
        assert_eq!(first_keyword("/* hi */ SELECT 1"), "SELECT");
        assert_eq!(first_keyword("-- c\nBEGIN"), "BEGIN");
        assert_eq!(first_keyword("  "), "");
    }

    #[test]
    fn test_decode_binary_params() {
        assert_eq!(decode_binary_param(23, &42i32.to_be_bytes()).unwrap(), "42");
        assert_eq!(
            decode_binary_param(20, &(-7i64).to_be_bytes()).unwrap(),
            "-7"
        );
        assert_eq!(decode_binary_param(16, &[1]).unwrap(), "1");
        assert_eq!(decode_binary_param(17, &[0xde, 0xad]).unwrap(), "\\xdead");
    }
}
