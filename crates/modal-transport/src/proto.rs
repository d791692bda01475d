//! Protobuf messages for the control-plane and command-router RPCs this crate
//! issues. Only the fields the transport reads or writes are declared.

/// Request for a fresh account auth token.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthTokenGetRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthTokenGetResponse {
    #[prost(string, tag = "1")]
    pub token: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskGetCommandRouterAccessRequest {
    #[prost(string, tag = "1")]
    pub task_id: ::prost::alloc::string::String,
}

/// Where to reach a task's command router and the session JWT to present.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskGetCommandRouterAccessResponse {
    #[prost(string, tag = "1")]
    pub url: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub jwt: ::prost::alloc::string::String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TaskExecStdoutConfig {
    Unspecified = 0,
    Pipe = 1,
    Devnull = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TaskExecStderrConfig {
    Unspecified = 0,
    Pipe = 1,
    Devnull = 2,
    Stdout = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TaskExecStdioFileDescriptor {
    Unspecified = 0,
    Stdout = 1,
    Stderr = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PtyType {
    Unspecified = 0,
    Function = 1,
    Shell = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PtyInfo {
    #[prost(bool, tag = "1")]
    pub enabled: bool,
    #[prost(uint32, tag = "2")]
    pub winsz_rows: u32,
    #[prost(uint32, tag = "3")]
    pub winsz_cols: u32,
    #[prost(string, tag = "4")]
    pub env_term: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub env_colorterm: ::prost::alloc::string::String,
    #[prost(string, tag = "6")]
    pub env_term_program: ::prost::alloc::string::String,
    #[prost(enumeration = "PtyType", tag = "7")]
    pub pty_type: i32,
    #[prost(bool, tag = "8")]
    pub no_terminate_on_idle_stdin: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskExecStartRequest {
    #[prost(string, tag = "1")]
    pub task_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub exec_id: ::prost::alloc::string::String,
    #[prost(string, repeated, tag = "3")]
    pub command_args: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(enumeration = "TaskExecStdoutConfig", tag = "4")]
    pub stdout_config: i32,
    #[prost(enumeration = "TaskExecStderrConfig", tag = "5")]
    pub stderr_config: i32,
    #[prost(uint32, optional, tag = "6")]
    pub timeout_secs: ::core::option::Option<u32>,
    #[prost(string, optional, tag = "7")]
    pub workdir: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, repeated, tag = "8")]
    pub secret_ids: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(message, optional, tag = "9")]
    pub pty_info: ::core::option::Option<PtyInfo>,
    #[prost(bool, tag = "10")]
    pub runtime_debug: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskExecStartResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskExecStdinWriteRequest {
    #[prost(string, tag = "1")]
    pub task_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub exec_id: ::prost::alloc::string::String,
    #[prost(uint64, tag = "3")]
    pub offset: u64,
    #[prost(bytes = "bytes", tag = "4")]
    pub data: ::prost::bytes::Bytes,
    #[prost(bool, tag = "5")]
    pub eof: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskExecStdinWriteResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskExecPollRequest {
    #[prost(string, tag = "1")]
    pub task_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub exec_id: ::prost::alloc::string::String,
}

/// Exit status of an exec. Empty while the process is still running.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskExecPollResponse {
    #[prost(oneof = "exec_exit_status::ExitStatus", tags = "1, 2")]
    pub exit_status: ::core::option::Option<exec_exit_status::ExitStatus>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskExecWaitRequest {
    #[prost(string, tag = "1")]
    pub task_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub exec_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskExecWaitResponse {
    #[prost(oneof = "exec_exit_status::ExitStatus", tags = "1, 2")]
    pub exit_status: ::core::option::Option<exec_exit_status::ExitStatus>,
}

pub mod exec_exit_status {
    #[derive(Clone, Copy, PartialEq, ::prost::Oneof)]
    pub enum ExitStatus {
        #[prost(int32, tag = "1")]
        Code(i32),
        #[prost(int32, tag = "2")]
        Signal(i32),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskExecStdioReadRequest {
    #[prost(string, tag = "1")]
    pub task_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub exec_id: ::prost::alloc::string::String,
    #[prost(uint64, tag = "3")]
    pub offset: u64,
    #[prost(enumeration = "TaskExecStdioFileDescriptor", tag = "4")]
    pub file_descriptor: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskExecStdioReadResponse {
    #[prost(bytes = "bytes", tag = "1")]
    pub data: ::prost::bytes::Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskMountDirectoryRequest {
    #[prost(string, tag = "1")]
    pub task_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub path: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub image_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskMountDirectoryResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskSnapshotDirectoryRequest {
    #[prost(string, tag = "1")]
    pub task_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub path: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskSnapshotDirectoryResponse {
    #[prost(string, tag = "1")]
    pub image_id: ::prost::alloc::string::String,
}
