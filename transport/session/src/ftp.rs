//! FTP client: control-channel line protocol plus passive-mode data
//! channels for listings and file transfers.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use wharf_sock::{IpAddress, Status, TcpSocket};

/// Transfer buffer for data-channel I/O.
const DATA_CHUNK: usize = 1024;

/// How a file's bytes travel over the data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Bytes transferred unchanged
    #[default]
    Binary,
    /// Text mode; servers may rewrite line endings
    Ascii,
    /// EBCDIC character encoding, for mainframe peers
    Ebcdic,
}

/// Status taxonomy of FTP replies.
///
/// The wire values are the protocol's three-digit codes; the 1000-range
/// values are generated locally when no valid reply was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtpStatus {
    /// 110 — restart marker reply
    RestartMarkerReply,
    /// 120 — service ready in a few minutes
    ServiceReadySoon,
    /// 125 — data connection already opened
    DataConnectionAlreadyOpened,
    /// 150 — file status ok, opening data connection
    OpeningDataConnection,
    /// 200 — command ok
    Ok,
    /// 202 — command superfluous on this server
    PointlessCommand,
    /// 211 — system status reply
    SystemStatus,
    /// 212 — directory status
    DirectoryStatus,
    /// 213 — file status
    FileStatus,
    /// 214 — help message
    HelpMessage,
    /// 215 — system type name
    SystemType,
    /// 220 — service ready for a new user
    ServiceReady,
    /// 221 — closing control connection
    ClosingConnection,
    /// 225 — data connection open, no transfer in progress
    DataConnectionOpened,
    /// 226 — closing data connection
    ClosingDataConnection,
    /// 227 — entering passive mode
    EnteringPassiveMode,
    /// 230 — user logged in
    LoggedIn,
    /// 250 — requested file action completed
    FileActionOk,
    /// 257 — pathname created
    DirectoryOk,
    /// 331 — user name ok, password needed
    NeedPassword,
    /// 332 — account needed to log in
    NeedAccountToLogIn,
    /// 350 — file action pending further information
    NeedInformation,
    /// 421 — service not available
    ServiceUnavailable,
    /// 425 — cannot open the data connection
    DataConnectionUnavailable,
    /// 426 — connection closed, transfer aborted
    TransferAborted,
    /// 450 — file action not taken
    FileActionAborted,
    /// 451 — action aborted by a local error
    LocalError,
    /// 452 — not enough storage space
    InsufficientStorageSpace,
    /// 500 — command unrecognized
    CommandUnknown,
    /// 501 — syntax error in parameters
    ParametersUnknown,
    /// 502 — command not implemented
    CommandNotImplemented,
    /// 503 — bad sequence of commands
    BadCommandSequence,
    /// 504 — command not implemented for that parameter
    ParameterNotImplemented,
    /// 530 — not logged in
    NotLoggedIn,
    /// 532 — account needed to store files
    NeedAccountToStore,
    /// 550 — requested action not taken
    FileUnavailable,
    /// 551 — page type unknown
    PageTypeUnknown,
    /// 552 — file action aborted, quota exceeded
    NotEnoughMemory,
    /// 553 — file name not allowed
    FilenameNotAllowed,
    /// Any other code the server produced
    Other(u16),
    /// Reply did not parse as FTP
    InvalidResponse,
    /// Connection with the server failed
    ConnectionFailed,
    /// Connection with the server closed
    ConnectionClosed,
    /// Local file could not be opened or created
    InvalidFile,
}

impl FtpStatus {
    /// Map a numeric wire code onto the status taxonomy.
    pub fn from_code(code: u16) -> Self {
        match code {
            110 => Self::RestartMarkerReply,
            120 => Self::ServiceReadySoon,
            125 => Self::DataConnectionAlreadyOpened,
            150 => Self::OpeningDataConnection,
            200 => Self::Ok,
            202 => Self::PointlessCommand,
            211 => Self::SystemStatus,
            212 => Self::DirectoryStatus,
            213 => Self::FileStatus,
            214 => Self::HelpMessage,
            215 => Self::SystemType,
            220 => Self::ServiceReady,
            221 => Self::ClosingConnection,
            225 => Self::DataConnectionOpened,
            226 => Self::ClosingDataConnection,
            227 => Self::EnteringPassiveMode,
            230 => Self::LoggedIn,
            250 => Self::FileActionOk,
            257 => Self::DirectoryOk,
            331 => Self::NeedPassword,
            332 => Self::NeedAccountToLogIn,
            350 => Self::NeedInformation,
            421 => Self::ServiceUnavailable,
            425 => Self::DataConnectionUnavailable,
            426 => Self::TransferAborted,
            450 => Self::FileActionAborted,
            451 => Self::LocalError,
            452 => Self::InsufficientStorageSpace,
            500 => Self::CommandUnknown,
            501 => Self::ParametersUnknown,
            502 => Self::CommandNotImplemented,
            503 => Self::BadCommandSequence,
            504 => Self::ParameterNotImplemented,
            530 => Self::NotLoggedIn,
            532 => Self::NeedAccountToStore,
            550 => Self::FileUnavailable,
            551 => Self::PageTypeUnknown,
            552 => Self::NotEnoughMemory,
            553 => Self::FilenameNotAllowed,
            other => Self::Other(other),
        }
    }

    /// The numeric code, with local statuses in the 1000 range.
    pub fn code(self) -> u16 {
        match self {
            Self::RestartMarkerReply => 110,
            Self::ServiceReadySoon => 120,
            Self::DataConnectionAlreadyOpened => 125,
            Self::OpeningDataConnection => 150,
            Self::Ok => 200,
            Self::PointlessCommand => 202,
            Self::SystemStatus => 211,
            Self::DirectoryStatus => 212,
            Self::FileStatus => 213,
            Self::HelpMessage => 214,
            Self::SystemType => 215,
            Self::ServiceReady => 220,
            Self::ClosingConnection => 221,
            Self::DataConnectionOpened => 225,
            Self::ClosingDataConnection => 226,
            Self::EnteringPassiveMode => 227,
            Self::LoggedIn => 230,
            Self::FileActionOk => 250,
            Self::DirectoryOk => 257,
            Self::NeedPassword => 331,
            Self::NeedAccountToLogIn => 332,
            Self::NeedInformation => 350,
            Self::ServiceUnavailable => 421,
            Self::DataConnectionUnavailable => 425,
            Self::TransferAborted => 426,
            Self::FileActionAborted => 450,
            Self::LocalError => 451,
            Self::InsufficientStorageSpace => 452,
            Self::CommandUnknown => 500,
            Self::ParametersUnknown => 501,
            Self::CommandNotImplemented => 502,
            Self::BadCommandSequence => 503,
            Self::ParameterNotImplemented => 504,
            Self::NotLoggedIn => 530,
            Self::NeedAccountToStore => 532,
            Self::FileUnavailable => 550,
            Self::PageTypeUnknown => 551,
            Self::NotEnoughMemory => 552,
            Self::FilenameNotAllowed => 553,
            Self::Other(code) => code,
            Self::InvalidResponse => 1000,
            Self::ConnectionFailed => 1001,
            Self::ConnectionClosed => 1002,
            Self::InvalidFile => 1003,
        }
    }
}

/// A reply received on the control channel.
#[derive(Debug, Clone)]
pub struct FtpResponse {
    status: FtpStatus,
    message: String,
}

impl FtpResponse {
    fn new(status: FtpStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Whether the reply is a success (any code below 400).
    pub fn is_ok(&self) -> bool {
        self.status.code() < 400
    }

    /// The reply status.
    pub fn status(&self) -> FtpStatus {
        self.status
    }

    /// The server's message text.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Reply to a working-directory query, carrying the directory.
#[derive(Debug, Clone)]
pub struct DirectoryResponse {
    response: FtpResponse,
    directory: PathBuf,
}

impl DirectoryResponse {
    fn new(response: FtpResponse) -> Self {
        // The server quotes the directory inside the message.
        let directory = if response.is_ok() {
            let message = response.message();
            match (message.find('"'), message.rfind('"')) {
                (Some(begin), Some(end)) if begin != end => {
                    PathBuf::from(&message[begin + 1..end])
                }
                _ => PathBuf::new(),
            }
        } else {
            PathBuf::new()
        };
        Self { response, directory }
    }

    /// Whether the reply is a success.
    pub fn is_ok(&self) -> bool {
        self.response.is_ok()
    }

    /// The reply status.
    pub fn status(&self) -> FtpStatus {
        self.response.status()
    }

    /// The server's message text.
    pub fn message(&self) -> &str {
        self.response.message()
    }

    /// The current working directory reported by the server.
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

/// Reply to a listing request, carrying the directory entries.
#[derive(Debug, Clone)]
pub struct ListingResponse {
    response: FtpResponse,
    listing: Vec<PathBuf>,
}

impl ListingResponse {
    fn new(response: FtpResponse, data: &[u8]) -> Self {
        let listing = if response.is_ok() {
            String::from_utf8_lossy(data)
                .split("\r\n")
                .filter(|entry| !entry.is_empty())
                .map(PathBuf::from)
                .collect()
        } else {
            Vec::new()
        };
        Self { response, listing }
    }

    /// Whether the reply is a success.
    pub fn is_ok(&self) -> bool {
        self.response.is_ok()
    }

    /// The reply status.
    pub fn status(&self) -> FtpStatus {
        self.response.status()
    }

    /// The server's message text.
    pub fn message(&self) -> &str {
        self.response.message()
    }

    /// The directory entries.
    pub fn listing(&self) -> &[PathBuf] {
        &self.listing
    }
}

/// An FTP client session over one control connection.
///
/// Transfers open a second, short-lived data connection in passive mode,
/// so the client also works from behind NAT.
#[derive(Default)]
pub struct Ftp {
    command: TcpSocket,
    receive_buffer: Vec<u8>,
}

impl Ftp {
    /// Create a client with no connection yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect the control channel and read the server's greeting.
    pub fn connect(&mut self, server: IpAddress, port: u16, timeout: Duration) -> FtpResponse {
        if self.command.connect(server, port, timeout) != Status::Done {
            return FtpResponse::new(FtpStatus::ConnectionFailed, "");
        }
        self.receive_response()
    }

    /// Log in anonymously.
    pub fn login(&mut self) -> FtpResponse {
        self.login_as("anonymous", "user@wharf.dev")
    }

    /// Log in with a user name and password.
    pub fn login_as(&mut self, name: &str, password: &str) -> FtpResponse {
        let response = self.send_command("USER", name);
        if response.is_ok() {
            return self.send_command("PASS", password);
        }
        response
    }

    /// Say goodbye and close the control channel.
    pub fn disconnect(&mut self) -> FtpResponse {
        let response = self.send_command("QUIT", "");
        if response.is_ok() {
            self.command.disconnect();
        }
        response
    }

    /// No-op request keeping the connection from timing out.
    pub fn keep_alive(&mut self) -> FtpResponse {
        self.send_command("NOOP", "")
    }

    /// The server-side working directory.
    pub fn working_directory(&mut self) -> DirectoryResponse {
        DirectoryResponse::new(self.send_command("PWD", ""))
    }

    /// The names in a server-side directory ("" for the current one).
    pub fn directory_listing(&mut self, directory: &str) -> ListingResponse {
        let mut data = Vec::new();

        let response = match self.open_data_channel(TransferMode::Ascii) {
            Ok(channel) => {
                let response = self.send_command("NLST", directory);
                if response.is_ok() {
                    receive_data(channel, &mut data);
                    self.receive_response()
                } else {
                    response
                }
            }
            Err(failure) => failure,
        };

        ListingResponse::new(response, &data)
    }

    /// Change the server-side working directory.
    pub fn change_directory(&mut self, directory: &str) -> FtpResponse {
        self.send_command("CWD", directory)
    }

    /// Move up to the parent directory.
    pub fn parent_directory(&mut self) -> FtpResponse {
        self.send_command("CDUP", "")
    }

    /// Create a server-side directory.
    pub fn create_directory(&mut self, name: &str) -> FtpResponse {
        self.send_command("MKD", name)
    }

    /// Remove an empty server-side directory.
    pub fn delete_directory(&mut self, name: &str) -> FtpResponse {
        self.send_command("RMD", name)
    }

    /// Rename a server-side file.
    pub fn rename_file(&mut self, file: &str, new_name: &str) -> FtpResponse {
        let response = self.send_command("RNFR", file);
        if response.is_ok() {
            return self.send_command("RNTO", new_name);
        }
        response
    }

    /// Delete a server-side file.
    pub fn delete_file(&mut self, name: &str) -> FtpResponse {
        self.send_command("DELE", name)
    }

    /// Download `remote_file` into the local directory `local_path`.
    ///
    /// A failed transfer removes the partially written local file.
    pub fn download(
        &mut self,
        remote_file: &str,
        local_path: &str,
        mode: TransferMode,
    ) -> FtpResponse {
        let channel = match self.open_data_channel(mode) {
            Ok(channel) => channel,
            Err(failure) => return failure,
        };

        let response = self.send_command("RETR", remote_file);
        if !response.is_ok() {
            return response;
        }

        let filename = Path::new(remote_file)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_default();
        let local_filepath = Path::new(local_path).join(filename);

        let Ok(mut file) = File::create(&local_filepath) else {
            return FtpResponse::new(FtpStatus::InvalidFile, "");
        };

        receive_data(channel, &mut DownloadSink(&mut file));
        drop(file);

        let response = self.receive_response();
        if !response.is_ok() {
            let _ = std::fs::remove_file(&local_filepath);
        }
        response
    }

    /// Upload `local_file` into the server-side directory `remote_path`,
    /// appending instead of replacing when `append` is set.
    pub fn upload(
        &mut self,
        local_file: &str,
        remote_path: &str,
        mode: TransferMode,
        append: bool,
    ) -> FtpResponse {
        let channel = match self.open_data_channel(mode) {
            Ok(channel) => channel,
            Err(failure) => return failure,
        };

        let Ok(mut file) = File::open(local_file) else {
            return FtpResponse::new(FtpStatus::InvalidFile, "");
        };

        let filename = Path::new(local_file)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("");

        let mut path = remote_path.to_owned();
        if !path.is_empty() && !path.ends_with('/') {
            path.push('/');
        }

        let command = if append { "APPE" } else { "STOR" };
        let response = self.send_command(command, &format!("{path}{filename}"));
        if !response.is_ok() {
            return response;
        }

        send_data(channel, &mut file);
        self.receive_response()
    }

    /// Send one command and read its reply.
    pub fn send_command(&mut self, command: &str, parameter: &str) -> FtpResponse {
        let command_str = if parameter.is_empty() {
            format!("{command}\r\n")
        } else {
            format!("{command} {parameter}\r\n")
        };

        if self.command.send(command_str.as_bytes()) != Status::Done {
            return FtpResponse::new(FtpStatus::ConnectionClosed, "");
        }
        self.receive_response()
    }

    /// Read one complete reply from the control channel.
    fn receive_response(&mut self) -> FtpResponse {
        let mut buffer = [0u8; DATA_CHUNK];
        loop {
            if let Some(response) = parse_reply(&mut self.receive_buffer) {
                return response;
            }

            let (status, received) = self.command.receive(&mut buffer);
            if status != Status::Done {
                if status == Status::Disconnected {
                    return FtpResponse::new(FtpStatus::ConnectionClosed, "");
                }
                return FtpResponse::new(FtpStatus::InvalidResponse, "");
            }
            self.receive_buffer.extend_from_slice(&buffer[..received]);
        }
    }

    /// Open a passive-mode data connection and set the transfer type.
    fn open_data_channel(&mut self, mode: TransferMode) -> Result<TcpSocket, FtpResponse> {
        let response = self.send_command("PASV", "");
        if !response.is_ok() {
            return Err(response);
        }

        let Some((address, port)) = parse_passive_endpoint(response.message()) else {
            return Err(FtpResponse::new(FtpStatus::InvalidResponse, ""));
        };

        let mut data_socket = TcpSocket::new();
        if data_socket.connect(address, port, Duration::ZERO) != Status::Done {
            return Err(FtpResponse::new(FtpStatus::ConnectionFailed, ""));
        }

        let type_code = match mode {
            TransferMode::Binary => "I",
            TransferMode::Ascii => "A",
            TransferMode::Ebcdic => "E",
        };
        let response = self.send_command("TYPE", type_code);
        if !response.is_ok() {
            return Err(response);
        }

        debug!("data channel open to {address}:{port}");
        Ok(data_socket)
    }
}

/// Extract one complete reply from the receive buffer, if present.
///
/// Replies may span multiple lines; the final line starts with the
/// three-digit code followed by a space. Everything up to and including
/// that line is drained from the buffer.
fn parse_reply(buffer: &mut Vec<u8>) -> Option<FtpResponse> {
    let mut pos = 0;
    while pos < buffer.len() {
        let end = buffer[pos..]
            .windows(2)
            .position(|pair| pair == b"\r\n")
            .map(|offset| pos + offset)?;

        let line = &buffer[pos..end];
        pos = end + 2;

        if line.len() >= 4 && line[3] == b' ' {
            let status = if line[..3].iter().all(u8::is_ascii_digit) {
                let code = String::from_utf8_lossy(&line[..3]).parse::<u16>().unwrap_or(0);
                FtpStatus::from_code(code)
            } else {
                FtpStatus::InvalidResponse
            };
            let message = if line.len() > 4 {
                String::from_utf8_lossy(&line[4..]).into_owned()
            } else {
                String::new()
            };

            buffer.drain(..pos);
            return Some(FtpResponse::new(status, message));
        }
    }
    None
}

/// Pull the host and port out of a passive-mode reply:
/// "Entering Passive Mode (h1,h2,h3,h4,p1,p2)".
fn parse_passive_endpoint(message: &str) -> Option<(IpAddress, u16)> {
    let begin = message.find('(')?;
    let end = message.find(')')?;
    if end <= begin {
        return None;
    }

    let mut numbers = message[begin + 1..end].split(',');
    let mut next = || numbers.next()?.trim().parse::<u8>().ok();

    let address = IpAddress::from_bytes(next()?, next()?, next()?, next()?);
    let port = u16::from(next()?) * 256 + u16::from(next()?);
    Some((address, port))
}

/// Drain the data channel into `sink` until the server closes it.
fn receive_data(mut channel: TcpSocket, sink: &mut impl DataSink) {
    let mut buffer = [0u8; DATA_CHUNK];
    loop {
        let (status, received) = channel.receive(&mut buffer);
        if status != Status::Done {
            break;
        }
        if !sink.write_all_data(&buffer[..received]) {
            break;
        }
    }
    channel.disconnect();
}

/// Stream `source` over the data channel, then close it to mark the end
/// of the transfer.
fn send_data(mut channel: TcpSocket, source: &mut impl Read) {
    let mut buffer = [0u8; DATA_CHUNK];
    loop {
        let count = match source.read(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(count) => count,
        };
        if channel.send(&buffer[..count]) != Status::Done {
            break;
        }
    }
    channel.disconnect();
}

/// Destination for data-channel bytes.
trait DataSink {
    /// Store the bytes; false aborts the transfer.
    fn write_all_data(&mut self, data: &[u8]) -> bool;
}

impl DataSink for Vec<u8> {
    fn write_all_data(&mut self, data: &[u8]) -> bool {
        self.extend_from_slice(data);
        true
    }
}

/// File-backed sink used by downloads.
struct DownloadSink<'a>(&'a mut File);

impl DataSink for DownloadSink<'_> {
    fn write_all_data(&mut self, data: &[u8]) -> bool {
        self.0.write_all(data).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply_single_line() {
        let mut buffer = b"220 Service ready\r\n".to_vec();
        let response = parse_reply(&mut buffer).expect("complete reply");
        assert_eq!(response.status(), FtpStatus::ServiceReady);
        assert_eq!(response.message(), "Service ready");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_parse_reply_multi_line() {
        let mut buffer = b"230-Welcome\r\n230-Enjoy your stay\r\n230 Logged in\r\n".to_vec();
        let response = parse_reply(&mut buffer).expect("complete reply");
        assert_eq!(response.status(), FtpStatus::LoggedIn);
        assert_eq!(response.message(), "Logged in");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_parse_reply_incomplete_waits() {
        let mut buffer = b"220 almost".to_vec();
        assert!(parse_reply(&mut buffer).is_none());
        assert_eq!(buffer, b"220 almost");

        buffer.extend_from_slice(b" there\r\n");
        let response = parse_reply(&mut buffer).expect("now complete");
        assert_eq!(response.status(), FtpStatus::ServiceReady);
    }

    #[test]
    fn test_parse_reply_keeps_following_bytes() {
        let mut buffer = b"200 Ok\r\n150 Opening\r\n".to_vec();
        let first = parse_reply(&mut buffer).expect("first reply");
        assert_eq!(first.status(), FtpStatus::Ok);
        assert_eq!(buffer, b"150 Opening\r\n");
    }

    #[test]
    fn test_parse_reply_non_numeric_code() {
        let mut buffer = b"abc message\r\n".to_vec();
        let response = parse_reply(&mut buffer).expect("reply");
        assert_eq!(response.status(), FtpStatus::InvalidResponse);
    }

    #[test]
    fn test_parse_passive_endpoint() {
        let endpoint =
            parse_passive_endpoint("Entering Passive Mode (192,168,1,9,19,137).");
        let (address, port) = endpoint.expect("endpoint");
        assert_eq!(address, IpAddress::from_bytes(192, 168, 1, 9));
        assert_eq!(port, 19 * 256 + 137);

        assert!(parse_passive_endpoint("no brackets here").is_none());
        assert!(parse_passive_endpoint("(1,2,3)").is_none());
    }

    #[test]
    fn test_directory_response_extracts_quoted_path() {
        let reply = FtpResponse::new(FtpStatus::DirectoryOk, "\"/home/user\" created");
        let response = DirectoryResponse::new(reply);
        assert_eq!(response.directory(), Path::new("/home/user"));

        let reply = FtpResponse::new(FtpStatus::FileUnavailable, "\"/nope\"");
        let response = DirectoryResponse::new(reply);
        assert_eq!(response.directory(), Path::new(""));
    }

    #[test]
    fn test_listing_response_splits_lines() {
        let reply = FtpResponse::new(FtpStatus::ClosingDataConnection, "");
        let listing = ListingResponse::new(reply, b"a.txt\r\nsub/b.txt\r\n");
        assert_eq!(
            listing.listing(),
            &[PathBuf::from("a.txt"), PathBuf::from("sub/b.txt")]
        );
    }

    #[test]
    fn test_status_code_round_trip() {
        for code in [110, 200, 227, 331, 425, 530, 553] {
            assert_eq!(FtpStatus::from_code(code).code(), code);
        }
        assert_eq!(FtpStatus::from_code(299), FtpStatus::Other(299));
        assert!(FtpResponse::new(FtpStatus::from_code(299), "").is_ok());
        assert!(!FtpResponse::new(FtpStatus::from_code(421), "").is_ok());
    }
}
