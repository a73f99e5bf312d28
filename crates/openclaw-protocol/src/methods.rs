// Well-known WS method names — must match OpenClaw client expectations.

// chat
pub const CHAT_SEND: &str = "chat.send";
pub const CHAT_ABORT: &str = "chat.abort";
pub const CHAT_HISTORY: &str = "chat.history";
pub const CHAT_INJECT: &str = "chat.inject";

// sessions
pub const SESSIONS_LIST: &str = "sessions.list";
pub const SESSIONS_GET: &str = "sessions.get";
pub const SESSIONS_PREVIEW: &str = "sessions.preview";
pub const SESSIONS_RESOLVE: &str = "sessions.resolve";

// memory
pub const MEMORY_SEARCH: &str = "memory.search";
pub const MEMORY_LEARN: &str = "memory.learn";
pub const MEMORY_FORGET: &str = "memory.forget";

// terminal
pub const TERMINAL_EXEC: &str = "terminal.exec";
pub const TERMINAL_CREATE: &str = "terminal.create";
pub const TERMINAL_WRITE: &str = "terminal.write";
pub const TERMINAL_READ: &str = "terminal.read";
pub const TERMINAL_KILL: &str = "terminal.kill";
pub const TERMINAL_LIST: &str = "terminal.list";
pub const TERMINAL_EXEC_BG: &str = "terminal.exec_bg";
pub const TERMINAL_JOB_STATUS: &str = "terminal.job_status";
pub const TERMINAL_JOB_LIST: &str = "terminal.job_list";
pub const TERMINAL_JOB_KILL: &str = "terminal.job_kill";

// config
pub const CONFIG_GET: &str = "config.get";
pub const CONFIG_SET: &str = "config.set";

// agent
pub const AGENT_STATUS: &str = "agent.status";
pub const AGENT_LIST: &str = "agent.list";

// channels
pub const CHANNELS_STATUS: &str = "channels.status";
pub const CHANNELS_LOGOUT: &str = "channels.logout";

// cron / scheduler
pub const CRON_LIST: &str = "cron.list";
pub const CRON_ADD: &str = "cron.add";
pub const CRON_DELETE: &str = "cron.delete";

// node (multi-node, future)
pub const NODE_LIST: &str = "node.list";
pub const NODE_INVOKE: &str = "node.invoke";

// mesh (DAG workflow orchestration)
pub const MESH_RUN: &str = "mesh.run";
pub const MESH_STATUS: &str = "mesh.status";
pub const MESH_CANCEL: &str = "mesh.cancel";
pub const MESH_RETRY: &str = "mesh.retry";

// handshake
pub const CONNECT: &str = "connect";
