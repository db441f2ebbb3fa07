//! Per-connection IRC protocol adapter.
//!
//! Each client connection runs one read loop feeding this state machine and
//! one writer task owning the socket's write half. Every outbound frame —
//! command replies and bus-driven deliveries alike — goes through the same
//! queue, so the transport stays single-writer.
//!
//! Registration walks `Greeting → AwaitingPass → AwaitingNick → Registered`;
//! `PASS` stores the password and `NICK` runs the credential check plus
//! realm admission. `Closed` is reached by QUIT, a failed login, or the
//! peer going away.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::auth::AuthError;
use crate::db::{self, DbError};
use crate::group::ShardedGroup;
use crate::irc::{self, Message};
use crate::realm::RealmError;
use crate::server::Node;
use crate::user::{ClientHandle, ShardedUser};

/// Origin of the service notices around login.
const NICKSERV_PREFIX: &str = "NickServ!NickServ@services";
/// Stand-in when the client never sent PASS.
const DEFAULT_PASSWORD: &str = "no password";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Greeting,
    AwaitingPass,
    AwaitingNick,
    Registered,
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

// ─── Connection lifecycle ────────────────────────────────────────────────────

/// Drive one client connection to completion. Connection loss (or QUIT)
/// triggers logout, which detaches the user everywhere on this node.
pub async fn handle_connection(node: Arc<Node>, stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    debug!("serving {peer}");

    let (read_half, write_half) = stream.into_split();
    let (out, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(write_half, out_rx));

    let mut conn = Connection::new(node, out);
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if conn.handle_line(&buf).await == Flow::Close {
                    break;
                }
            }
            Err(e) => {
                debug!("read error from {peer}: {e}");
                break;
            }
        }
    }

    conn.close().await;
    // Dropping the connection drops the queue sender; the writer drains what
    // is left and shuts the socket down.
    drop(conn);
    let _ = writer.await;
    debug!("done with {peer}");
}

async fn write_loop(mut half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        if half.write_all(line.as_bytes()).await.is_err()
            || half.write_all(b"\r\n").await.is_err()
        {
            break;
        }
    }
    let _ = half.shutdown().await;
}

// ─── State machine ───────────────────────────────────────────────────────────

struct Connection {
    node: Arc<Node>,
    out: mpsc::UnboundedSender<String>,
    state: SessionState,
    password: Option<String>,
    nick: Option<String>,
    realname: Option<String>,
    user: Option<Arc<ShardedUser>>,
}

impl Connection {
    fn new(node: Arc<Node>, out: mpsc::UnboundedSender<String>) -> Self {
        Self {
            node,
            out,
            state: SessionState::Greeting,
            password: None,
            nick: None,
            realname: None,
            user: None,
        }
    }

    async fn handle_line(&mut self, bytes: &[u8]) -> Flow {
        let Ok(text) = std::str::from_utf8(bytes) else {
            self.decode_failure(bytes);
            return Flow::Continue;
        };
        let Some(msg) = Message::parse(text) else {
            return Flow::Continue;
        };
        if self.state == SessionState::Greeting {
            self.state = SessionState::AwaitingPass;
        }

        match msg.command.as_str() {
            "PASS" => self.cmd_pass(msg),
            "NICK" => return self.cmd_nick(msg).await,
            "USER" => self.cmd_user(msg),
            "PING" => self.cmd_ping(msg),
            "QUIT" => {
                self.state = SessionState::Closed;
                return Flow::Close;
            }
            cmd => {
                if self.state != SessionState::Registered {
                    debug!("ignoring {cmd} before registration");
                    return Flow::Continue;
                }
                match cmd {
                    "JOIN" => self.cmd_join(msg).await,
                    "PART" => self.cmd_part(msg).await,
                    "NAMES" => self.cmd_names(msg).await,
                    "LIST" => self.cmd_list(msg).await,
                    "WHO" => self.cmd_who(msg).await,
                    "WHOIS" => self.cmd_whois(msg).await,
                    "PRIVMSG" => self.cmd_privmsg(msg).await,
                    other => self.reply(
                        irc::ERR_UNKNOWNCOMMAND,
                        vec![other.to_string(), "Unknown command".to_string()],
                    ),
                }
            }
        }
        Flow::Continue
    }

    /// Per-command numerics for lines whose parameters were not valid UTF-8;
    /// the command itself is recovered lossily and the line dropped.
    fn decode_failure(&self, bytes: &[u8]) {
        let lossy = String::from_utf8_lossy(bytes).into_owned();
        let Some(msg) = Message::parse(&lossy) else {
            return;
        };
        let param = msg.params.first().cloned().unwrap_or_else(|| "*".to_string());
        match msg.command.as_str() {
            "JOIN" | "NAMES" | "LIST" => self.reply(
                irc::ERR_NOSUCHCHANNEL,
                vec![param, "No such channel (could not decode your unicode!)".to_string()],
            ),
            "PART" => self.reply(
                irc::ERR_NOTONCHANNEL,
                vec![param, "Could not decode your unicode!".to_string()],
            ),
            "WHOIS" | "PRIVMSG" => self.reply(
                irc::ERR_NOSUCHNICK,
                vec![param, "No such nick/channel".to_string()],
            ),
            "WHO" => self.reply(
                irc::RPL_ENDOFWHO,
                vec![param, "End of /WHO list (could not decode your unicode!)".to_string()],
            ),
            other => debug!("undecodable {other} line dropped"),
        }
    }

    // ── plumbing ─────────────────────────────────────────────────────────────

    fn send(&self, line: String) {
        if self.out.send(line).is_err() {
            debug!("write queue closed");
        }
    }

    /// Numeric reply; the first parameter is always the client.
    fn reply(&self, code: &str, params: Vec<String>) {
        let mut all = vec![self.nick.clone().unwrap_or_else(|| "*".to_string())];
        all.extend(params);
        self.send(irc::reply(&self.node.info.name, code, all));
    }

    fn nickserv_notice(&self, nick: &str, text: &str) {
        self.send(format!(":{NICKSERV_PREFIX} PRIVMSG {nick} :{text}"));
    }

    /// Store transport trouble is not the client's fault; keep the
    /// connection and say so.
    fn service_unavailable(&self, cmd: &str) {
        self.reply(
            irc::ERR_UNKNOWNCOMMAND,
            vec![cmd.to_string(), "Service temporarily unavailable".to_string()],
        );
    }

    fn origin(&self, nick: &str) -> String {
        format!("{nick}!{nick}@{}", self.node.info.name)
    }

    // ── registration ─────────────────────────────────────────────────────────

    fn cmd_pass(&mut self, msg: Message) {
        if self.state == SessionState::Registered {
            return;
        }
        if let Some(password) = msg.params.into_iter().next() {
            self.password = Some(password);
            self.state = SessionState::AwaitingNick;
        }
    }

    fn cmd_user(&mut self, msg: Message) {
        if let Some(realname) = msg.params.get(3) {
            self.realname = Some(realname.clone());
        }
    }

    fn cmd_ping(&self, msg: Message) {
        let token = msg.params.into_iter().next().unwrap_or_default();
        self.send(format!(":{} PONG {} :{token}", self.node.info.name, self.node.info.name));
    }

    async fn cmd_nick(&mut self, msg: Message) -> Flow {
        if self.state == SessionState::Registered {
            // Nick changes after login are out of scope; presence is bound
            // to the session row.
            return Flow::Continue;
        }
        let Some(nick) = msg.params.into_iter().next() else {
            return Flow::Continue;
        };
        let nick = nick.to_lowercase();
        self.nick = Some(nick.clone());

        // The MOTD goes out before the verdict, success or not.
        self.send_motd();

        let password = self.password.clone().unwrap_or_else(|| DEFAULT_PASSWORD.to_string());
        match self.node.auth.check(&nick, &password).await {
            Ok(()) => {}
            Err(AuthError::BadCredentials(_)) => {
                self.nickserv_notice(&nick, "Login failed. Goodbye.");
                self.state = SessionState::Closed;
                return Flow::Close;
            }
            Err(AuthError::Store(e)) => {
                warn!("credential check for {nick}: {e}");
                self.service_unavailable("NICK");
                return Flow::Continue;
            }
        }

        let client = ClientHandle::new(self.out.clone(), self.node.info.name.clone());
        match self.node.realm.request_avatar(&nick, client).await {
            Ok(user) => {
                self.user = Some(user);
                self.state = SessionState::Registered;
                self.send_welcome();
                info!("{nick} registered");
                Flow::Continue
            }
            Err(RealmError::AlreadyLoggedIn(_)) => {
                // The original session wins; this connection stays open.
                self.nickserv_notice(&nick, "Already logged in.  No pod people allowed!");
                self.state = SessionState::AwaitingNick;
                Flow::Continue
            }
            Err(e) => {
                warn!("admission for {nick}: {e}");
                self.service_unavailable("NICK");
                Flow::Continue
            }
        }
    }

    fn send_motd(&self) {
        self.reply(
            irc::RPL_MOTDSTART,
            vec![format!("- {} Message of the Day -", self.node.info.name)],
        );
        self.reply(irc::RPL_ENDOFMOTD, vec!["End of /MOTD command.".to_string()]);
    }

    fn send_welcome(&self) {
        let info = &self.node.info;
        self.reply(irc::RPL_WELCOME, vec![format!("connected to {}", info.name)]);
        self.reply(
            irc::RPL_YOURHOST,
            vec![format!("Your host is {}, running version {}", info.name, info.version)],
        );
        self.reply(
            irc::RPL_CREATED,
            vec![format!("This server was created on {}", info.created)],
        );
        self.reply(
            irc::RPL_MYINFO,
            vec![info.name.clone(), info.version.clone(), "w".to_string(), "n".to_string()],
        );
    }

    // ── channel commands ─────────────────────────────────────────────────────

    async fn cmd_join(&mut self, msg: Message) {
        let Some(raw) = msg.params.first() else {
            return;
        };
        let name = raw.strip_prefix('#').unwrap_or(raw).to_lowercase();
        let user = self.attached();

        let group = match self.node.realm.get_group(&name, &user.name).await {
            Ok(group) => group,
            Err(e) if is_transport(&e) => {
                warn!("JOIN #{name}: {e}");
                self.service_unavailable("JOIN");
                return;
            }
            Err(_) => {
                self.reply(
                    irc::ERR_NOSUCHCHANNEL,
                    vec![format!("#{name}"), "No such channel.".to_string()],
                );
                return;
            }
        };

        match user.join(&group).await {
            // Re-joining a channel is a harmless no-op.
            Ok(()) | Err(RealmError::AlreadyInGroup { .. }) => {}
            Err(e) => {
                warn!("JOIN #{name} roster: {e}");
                self.service_unavailable("JOIN");
                return;
            }
        }

        self.send(format!(":{} JOIN #{name}", self.origin(&user.name)));
        self.send_names(&group);
        self.send_topic(&group).await;
    }

    async fn cmd_part(&mut self, msg: Message) {
        let Some(raw) = msg.params.first() else {
            return;
        };
        let name = raw.strip_prefix('#').unwrap_or(raw).to_lowercase();
        let reason = msg.params.get(1).cloned();
        let user = self.attached();

        let group = match self.node.realm.lookup_group(&name) {
            Ok(group) => group,
            Err(_) => {
                self.reply(
                    irc::ERR_NOTONCHANNEL,
                    vec![format!("#{name}"), "You're not on that channel.".to_string()],
                );
                return;
            }
        };

        match user.leave(&group, reason.as_deref()).await {
            Ok(()) => {
                self.send(format!(
                    ":{} PART #{name} :{}",
                    self.origin(&user.name),
                    reason.unwrap_or_else(|| "leaving".to_string())
                ));
                self.node.realm.reap_group_if_empty(&name);
            }
            Err(RealmError::NotInGroup { .. }) => {
                self.reply(
                    irc::ERR_NOTONCHANNEL,
                    vec![format!("#{name}"), "You're not on that channel.".to_string()],
                );
            }
            Err(e) => {
                warn!("PART #{name}: {e}");
                self.service_unavailable("PART");
            }
        }
    }

    async fn cmd_names(&mut self, msg: Message) {
        let Some(raw) = msg.params.last() else {
            return;
        };
        let name = raw.strip_prefix('#').unwrap_or(raw).to_lowercase();
        match self.node.realm.lookup_group(&name) {
            Ok(group) => self.send_names(&group),
            // No local handle: an empty roster reply, not an error.
            Err(_) => {
                self.reply(
                    irc::RPL_NAMREPLY,
                    vec!["=".to_string(), format!("#{name}"), String::new()],
                );
                self.reply(
                    irc::RPL_ENDOFNAMES,
                    vec![format!("#{name}"), "End of /NAMES list".to_string()],
                );
            }
        }
    }

    fn send_names(&self, group: &ShardedGroup) {
        self.reply(
            irc::RPL_NAMREPLY,
            vec!["=".to_string(), format!("#{}", group.name), group.iterusers().join(" ")],
        );
        self.reply(
            irc::RPL_ENDOFNAMES,
            vec![format!("#{}", group.name), "End of /NAMES list".to_string()],
        );
    }

    async fn send_topic(&self, group: &ShardedGroup) {
        let topic = match self.node.store.lookup_group(&group.name).await {
            Ok(row) => row.map(|r| r.topic()).unwrap_or_default(),
            Err(e) => {
                warn!("topic for #{}: {e}", group.name);
                String::new()
            }
        };
        if topic.is_empty() {
            self.reply(
                irc::RPL_NOTOPIC,
                vec![format!("#{}", group.name), "No topic is set".to_string()],
            );
        } else {
            self.reply(irc::RPL_TOPIC, vec![format!("#{}", group.name), topic]);
        }
    }

    // ── cluster-wide queries ─────────────────────────────────────────────────

    /// LIST consults the store, not the local directory: groups with no
    /// handle on this node still show up, with counts from the membership
    /// heartbeats.
    async fn cmd_list(&mut self, msg: Message) {
        let store = &self.node.store;
        let rows = if let Some(arg) = msg.params.first() {
            let mut rows = Vec::new();
            for ch in arg.split(',') {
                let name = ch.strip_prefix('#').unwrap_or(ch);
                match store.lookup_group(name).await {
                    Ok(Some(row)) => rows.push(row),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("LIST {name}: {e}");
                        self.service_unavailable("LIST");
                        return;
                    }
                }
            }
            rows
        } else {
            match store.list_groups().await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!("LIST: {e}");
                    self.service_unavailable("LIST");
                    return;
                }
            }
        };

        self.reply(
            irc::RPL_LISTSTART,
            vec!["Channel".to_string(), "Users  Name".to_string()],
        );
        for row in rows {
            let count = store.group_heartbeats(&row.name).await.map(|m| m.len()).unwrap_or(0);
            self.reply(
                irc::RPL_LIST,
                vec![format!("#{}", row.name), count.to_string(), row.topic()],
            );
        }
        self.reply(irc::RPL_LISTEND, vec!["End of /LIST".to_string()]);
    }

    async fn cmd_who(&mut self, msg: Message) {
        let Some(mask) = msg.params.first().cloned() else {
            self.reply(irc::RPL_ENDOFWHO, vec!["/WHO not supported.".to_string()]);
            return;
        };

        if let Some(name) = mask.strip_prefix('#') {
            let store = &self.node.store;
            match store.lookup_group(name).await {
                Ok(Some(row)) => {
                    let beats = store.group_heartbeats(&row.name).await.unwrap_or_default();
                    let mut members: Vec<String> = beats.into_keys().collect();
                    members.sort();
                    for member in members {
                        self.reply(
                            irc::RPL_WHOREPLY,
                            vec![
                                format!("#{}", row.name),
                                member.clone(),
                                self.node.info.name.clone(),
                                self.node.realm.name.clone(),
                                member.clone(),
                                "H".to_string(),
                                format!("0 {member}"),
                            ],
                        );
                    }
                    self.reply(
                        irc::RPL_ENDOFWHO,
                        vec![mask.clone(), "End of /WHO list.".to_string()],
                    );
                }
                Ok(None) => self.reply(
                    irc::RPL_ENDOFWHO,
                    vec![mask.clone(), "End of /WHO list.".to_string()],
                ),
                Err(e) => {
                    warn!("WHO {mask}: {e}");
                    self.service_unavailable("WHO");
                }
            }
        } else {
            match self.node.realm.lookup_user(&mask).await {
                Ok(user) => {
                    self.reply(
                        irc::RPL_WHOREPLY,
                        vec![
                            "*".to_string(),
                            user.name.clone(),
                            self.node.info.name.clone(),
                            self.node.realm.name.clone(),
                            user.name.clone(),
                            "H".to_string(),
                            format!("0 {}", user.name),
                        ],
                    );
                    self.reply(
                        irc::RPL_ENDOFWHO,
                        vec![mask.clone(), "End of /WHO list.".to_string()],
                    );
                }
                Err(e) if is_transport(&e) => {
                    warn!("WHO {mask}: {e}");
                    self.service_unavailable("WHO");
                }
                Err(_) => self.reply(
                    irc::RPL_ENDOFWHO,
                    vec![mask.clone(), "End of /WHO list.".to_string()],
                ),
            }
        }
    }

    async fn cmd_whois(&mut self, msg: Message) {
        let Some(target) = msg.params.first().cloned() else {
            return;
        };
        let store = &self.node.store;
        let row = match store.lookup_user(&target).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                self.reply(
                    irc::ERR_NOSUCHNICK,
                    vec![target, "No such nick/channel".to_string()],
                );
                return;
            }
            Err(e) => {
                warn!("WHOIS {target}: {e}");
                self.service_unavailable("WHOIS");
                return;
            }
        };

        let session = store.lookup_user_session(&row.nickname).await.ok().flatten();
        let (idle, signon) = session
            .map(|s| {
                (
                    (db::now_ms() - s.last_heartbeat) / 1000,
                    s.last_heartbeat / 1000,
                )
            })
            .unwrap_or((0, 0));

        // The stored directory knows nothing beyond the nick; a client's own
        // USER realname is the one richer answer we can give.
        let realname = if self.nick.as_deref() == Some(row.nickname.as_str()) {
            self.realname.clone().unwrap_or_else(|| row.nickname.clone())
        } else {
            row.nickname.clone()
        };

        self.reply(
            irc::RPL_WHOISUSER,
            vec![
                row.nickname.clone(),
                row.nickname.clone(),
                self.node.realm.name.clone(),
                "*".to_string(),
                realname,
            ],
        );
        self.reply(
            irc::RPL_WHOISSERVER,
            vec![
                row.nickname.clone(),
                self.node.realm.name.clone(),
                self.node.realm.name.clone(),
            ],
        );
        self.reply(
            irc::RPL_WHOISIDLE,
            vec![
                row.nickname.clone(),
                idle.to_string(),
                signon.to_string(),
                "seconds idle, signon time".to_string(),
            ],
        );
        match store.list_groups_for_user(&row.nickname).await {
            Ok(groups) if !groups.is_empty() => {
                let channels: Vec<String> = groups.iter().map(|g| format!("#{g}")).collect();
                self.reply(
                    irc::RPL_WHOISCHANNELS,
                    vec![row.nickname.clone(), channels.join(" ")],
                );
            }
            Ok(_) => {}
            Err(e) => warn!("WHOIS channels for {}: {e}", row.nickname),
        }
        self.reply(
            irc::RPL_ENDOFWHOIS,
            vec![row.nickname, "End of WHOIS list.".to_string()],
        );
    }

    // ── chat ─────────────────────────────────────────────────────────────────

    async fn cmd_privmsg(&mut self, msg: Message) {
        let (Some(target), Some(text)) = (msg.params.first().cloned(), msg.params.get(1).cloned())
        else {
            return;
        };
        let user = self.attached();

        if let Some(name) = target.strip_prefix('#') {
            let name = name.to_lowercase();
            let group = match self.node.realm.lookup_group(&name) {
                Ok(group) => group,
                Err(_) => {
                    self.reply(
                        irc::ERR_NOSUCHCHANNEL,
                        vec![target, "No such channel.".to_string()],
                    );
                    return;
                }
            };
            for line in text.lines() {
                if let Err(e) = user.send_to_group(&group, line).await {
                    warn!("PRIVMSG #{name}: {e}");
                    self.service_unavailable("PRIVMSG");
                    return;
                }
            }
        } else {
            let recipient = match self.node.realm.lookup_user(&target).await {
                Ok(recipient) => recipient,
                Err(e) if is_transport(&e) => {
                    warn!("PRIVMSG {target}: {e}");
                    self.service_unavailable("PRIVMSG");
                    return;
                }
                Err(_) => {
                    self.reply(
                        irc::ERR_NOSUCHNICK,
                        vec![target, "No such nick/channel".to_string()],
                    );
                    return;
                }
            };
            for line in text.lines() {
                if let Err(e) = user.send_to_user(&recipient.name, line).await {
                    warn!("PRIVMSG {}: {e}", recipient.name);
                    self.service_unavailable("PRIVMSG");
                    return;
                }
            }
        }
    }

    // ── teardown ─────────────────────────────────────────────────────────────

    /// The registered user behind this connection. Only called from
    /// registered-state handlers.
    fn attached(&self) -> Arc<ShardedUser> {
        Arc::clone(self.user.as_ref().expect("registered state implies a user"))
    }

    async fn close(&mut self) {
        if let Some(user) = self.user.take() {
            self.node.realm.logout(&user.name).await;
        }
        self.state = SessionState::Closed;
    }
}

/// Store-unreachable errors get the "service unavailable" treatment instead
/// of a lookup-miss numeric.
fn is_transport(err: &RealmError) -> bool {
    matches!(err, RealmError::Store(DbError::Sqlx(_)))
}

// ─── Tests ────────────────────────────────────────────────────────────────────
