//! SSH sessions over the system `ssh` client.
//!
//! A session is opened once per host with a retried handshake; with a
//! control directory set, that handshake becomes the ControlMaster and
//! every later command rides the same connection.

use crate::error::{Error, Result};
use crate::retry::{LogCallback, with_retry};
use crate::types::{CommandOutput, SessionOptions, SshTarget};
use std::fs;
use std::io::{ErrorKind, Write};
use std::process::{Command, Stdio};
use std::thread;

/// An open connection to one host
#[derive(Debug)]
pub struct Session {
    target: SshTarget,
    options: SessionOptions,
    escalated: bool,
}

impl Session {
    fn new(target: SshTarget, options: &SessionOptions) -> Self {
        Self {
            target,
            options: options.clone(),
            escalated: false,
        }
    }

    /// Connect to `target`, retrying dropped negotiations.
    ///
    /// Fails with [`Error::MissingKey`] before touching the network when the
    /// key file doesn't exist.
    pub fn connect(target: SshTarget, options: &SessionOptions) -> Result<Self> {
        if !target.identity_file.is_file() {
            return Err(Error::MissingKey(target.identity_file));
        }
        if let Some(dir) = &options.control_dir {
            fs::create_dir_all(dir)?;
        }

        let session = Self::new(target, options);
        with_retry(&options.retry, Some(&LogCallback), || session.handshake())?;
        log::debug!("Connected to {}", session.target.endpoint());
        Ok(session)
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    /// Run every later command through `sudo -E`
    pub fn escalate(mut self) -> Self {
        self.escalated = true;
        self
    }

    pub fn is_escalated(&self) -> bool {
        self.escalated
    }

    /// Arguments for the ssh client, ending with the destination
    pub fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            self.target.identity_file.display().to_string(),
            "-p".to_string(),
            self.target.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout.as_secs()),
        ];
        if let Some(dir) = &self.options.control_dir {
            args.extend([
                "-o".to_string(),
                "ControlMaster=auto".to_string(),
                "-o".to_string(),
                format!("ControlPath={}/%C", dir.display()),
                "-o".to_string(),
                format!("ControlPersist={}s", self.options.control_persist.as_secs()),
            ]);
        }
        args.push(format!("{}@{}", self.target.user, self.target.hostname));
        args
    }

    /// The remote command line actually sent for `command`
    pub fn wrap(&self, command: &str) -> String {
        if self.escalated {
            format!("sudo -E -- sh -c {}", shell_quote(command))
        } else {
            command.to_string()
        }
    }

    /// Run `command` (escalated if the session is), feeding `input` on stdin
    pub fn exec(&self, command: &str, input: &[u8]) -> Result<CommandOutput> {
        self.raw(&self.wrap(command), input)
    }

    /// Like [`exec`](Self::exec) but a non-zero exit is an error
    pub fn exec_checked(&self, command: &str, input: &[u8]) -> Result<CommandOutput> {
        let output = self.exec(command, input)?;
        self.check(output)
    }

    /// Run `command` as the login user, never escalated
    pub fn exec_as_login(&self, command: &str, input: &[u8]) -> Result<CommandOutput> {
        let output = self.raw(command, input)?;
        self.check(output)
    }

    /// Whether `path` is an executable only the login user could have written.
    ///
    /// The file and its directory must both belong to the login user with no
    /// group or other write bit, and the file must not be a symlink.
    pub fn is_trusted_executable(&self, path: &str) -> Result<bool> {
        let file = shell_quote(path);
        let dir = shell_quote(parent_dir(path));
        let check = format!(
            "test -O {dir} && test ! -L {file} && test -O {file} && test -x {file} \
             && ! ls -ld {dir} {file} | cut -c6,9 | grep -q w"
        );
        let output = self.raw(&check, &[])?;
        if output.is_transport_failure() {
            return Err(self.classify(&output));
        }
        Ok(output.success)
    }

    /// Write `contents` to an executable file at `path`, atomically.
    ///
    /// The directory is created private to the login user; one owned by
    /// anybody else is refused.
    pub fn upload(&self, contents: &[u8], path: &str) -> Result<()> {
        let file = shell_quote(path);
        let part = shell_quote(&format!("{path}.part"));
        let script = format!(
            "umask 077 && mkdir -p {dir} && test ! -L {dir} && test -O {dir} && chmod 700 {dir} \
             && cat > {part} && chmod 700 {part} && mv -f {part} {file}",
            dir = shell_quote(parent_dir(path)),
        );
        self.exec_as_login(&script, contents)?;
        log::debug!(
            "Uploaded {} bytes to {}:{path}",
            contents.len(),
            self.target.endpoint()
        );
        Ok(())
    }

    /// Write `contents` to an executable `name` inside a fresh private
    /// temporary directory and return that directory.
    ///
    /// Nothing removes the directory but [`remove_all`](Self::remove_all).
    pub fn upload_scratch(&self, contents: &[u8], name: &str) -> Result<String> {
        let script = format!(
            "umask 077 && d=$(mktemp -d \"${{TMPDIR:-/tmp}}/convoy.XXXXXXXX\") \
             && cat > \"$d\"/{name} && chmod 700 \"$d\"/{name} && printf '%s\\n' \"$d\"",
            name = shell_quote(name),
        );
        let output = self.exec_as_login(&script, contents)?;
        let dir = output.stdout_str().trim().to_string();
        if dir.is_empty() {
            return Err(Error::Other(format!(
                "No temporary directory created on {}",
                self.target.endpoint()
            )));
        }
        log::debug!("Uploaded {} bytes to {}:{dir}", contents.len(), self.target.endpoint());
        Ok(dir)
    }

    /// Remove `path` and everything below it, as the login user
    pub fn remove_all(&self, path: &str) -> Result<()> {
        self.exec_as_login(&format!("rm -rf -- {}", shell_quote(path)), &[])?;
        Ok(())
    }

    /// Shut down the master connection, if any
    pub fn close(&self) {
        if self.options.control_dir.is_none() {
            return;
        }
        let mut args = self.ssh_args();
        let destination = args.pop().unwrap_or_default();
        let result = Command::new(&self.options.ssh_program)
            .args(&args)
            .args(["-O", "exit", destination.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = result {
            log::debug!("Closing {} failed: {e}", self.target.endpoint());
        }
    }

    fn handshake(&self) -> Result<()> {
        let output = self.raw("true", &[])?;
        if output.success {
            Ok(())
        } else {
            Err(self.classify(&output))
        }
    }

    fn check(&self, output: CommandOutput) -> Result<CommandOutput> {
        if output.success {
            Ok(output)
        } else if output.is_transport_failure() {
            Err(self.classify(&output))
        } else {
            Err(Error::CommandFailed {
                endpoint: self.target.endpoint(),
                code: output.code,
                stderr: output.stderr_str(),
            })
        }
    }

    fn classify(&self, output: &CommandOutput) -> Error {
        Error::from_ssh_output(
            &output.stderr_str(),
            &self.target.endpoint(),
            &remediation(&self.target),
        )
    }

    fn raw(&self, remote: &str, input: &[u8]) -> Result<CommandOutput> {
        log::trace!("ssh {} {remote}", self.target.endpoint());
        let mut child = Command::new(&self.options.ssh_program)
            .args(self.ssh_args())
            .arg(remote)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Feed stdin from a thread so a chatty remote can't deadlock us
        let writer = child.stdin.take().map(|mut stdin| {
            let data = input.to_vec();
            thread::spawn(move || stdin.write_all(&data))
        });
        let output = child.wait_with_output()?;

        if let Some(writer) = writer {
            match writer.join() {
                Ok(Err(e)) if e.kind() != ErrorKind::BrokenPipe => return Err(e.into()),
                Err(_) => return Err(Error::Other("stdin writer panicked".to_string())),
                _ => {}
            }
        }
        Ok(output.into())
    }
}

fn parent_dir(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((dir, _)) => dir,
        None => ".",
    }
}

/// Quote `s` for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Arguments for an interactive `ssh` to `target`, optionally running `remote`
pub fn manual_args(target: &SshTarget, remote: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "-i".to_string(),
        target.identity_file.display().to_string(),
        "-p".to_string(),
        target.port.to_string(),
        format!("{}@{}", target.user, target.hostname),
    ];
    if let Some(remote) = remote {
        args.push(remote.to_string());
    }
    args
}

/// The `ssh` command line an operator can run by hand
pub fn manual_command(target: &SshTarget, remote: Option<&str>) -> String {
    let mut words = vec!["ssh".to_string()];
    words.extend(manual_args(target, remote).iter().map(|a| shell_quote(a)));
    words.join(" ")
}

/// Command that drops the stale host key and reconnects interactively
pub fn remediation(target: &SshTarget) -> String {
    format!(
        "ssh-keygen -R {} && {}",
        shell_quote(&target.known_hosts_name()),
        manual_command(target, None)
    )
}
