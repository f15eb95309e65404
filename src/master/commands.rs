use super::files::{FileEntry, FileRegistry};
use crate::wire::codec::Wire;
use crate::wire::commands::{CommandArgs, FLUSH_TRIGGER, encode_params, validate};
use crate::wire::error::{WireError, WireResult};
use crate::wire::protocol::*;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};

/// A scene API call serialized once, replayable to any number of slaves.
#[derive(Debug, Clone)]
pub struct CompiledCommand {
    name: String,
    fields: String,
    params_blob: Option<Vec<u8>>,
    file_refs: Vec<(String, FileEntry)>,
}

impl CompiledCommand {
    /// Serializes `args` and resolves each of `file_params` through `files`.
    ///
    /// A file parameter is skipped when it is absent or empty, when its bytes travel
    /// inline as `<name>_data`, and for `usersamplingmap_filename` when the file does
    /// not exist locally.
    ///
    /// # Errors
    /// Fails when `args` do not fit the command or when a referenced file cannot be hashed.
    pub fn compile(
        name: &str,
        args: &CommandArgs,
        files: &mut FileRegistry,
        file_params: &[&str],
    ) -> anyhow::Result<Self> {
        validate(name, args)?;

        let mut file_refs = Vec::new();
        let params_blob = match args.params() {
            Some(params) => {
                for &param in file_params {
                    let Some(file) = params.find_one_string(param) else {
                        continue;
                    };
                    if file.is_empty() || params.has_embedded_data(param) {
                        continue;
                    }
                    if param == "usersamplingmap_filename" && !Path::new(file).exists() {
                        tracing::debug!("Skipping missing user sampling map '{}'", file);
                        continue;
                    }
                    let entry = files.add(Path::new(file)).map_err(|e| {
                        anyhow::anyhow!("unable to hash '{}' for parameter '{}': {}", file, param, e)
                    })?;
                    file_refs.push((param.to_string(), entry));
                }
                Some(encode_params(params)?)
            }
            None => None,
        };

        Ok(Self {
            name: name.to_string(),
            fields: args.plain_fields(),
            params_blob,
            file_refs,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_refs(&self) -> &[(String, FileEntry)] {
        &self.file_refs
    }

    pub fn has_params(&self) -> bool {
        self.params_blob.is_some()
    }

    /// Writes the command and, if it carries parameters, runs the file index negotiation.
    pub async fn send<S>(&self, wire: &mut Wire<S>, files: &mut FileRegistry) -> WireResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        wire.write_line(&self.name).await?;
        wire.write_raw(self.fields.as_bytes()).await?;

        let Some(blob) = &self.params_blob else {
            return Ok(());
        };
        wire.write_blob(blob).await?;

        if self.file_refs.is_empty() {
            return wire.write_line(FILE_INDEX_EMPTY).await;
        }

        wire.write_line(BEGIN_FILE_INDEX).await?;
        wire.expect_line(BEGIN_FILE_INDEX_OK).await?;
        for (param, entry) in &self.file_refs {
            wire.write_line(param).await?;
            wire.write_line(&entry.local_path().to_string_lossy()).await?;
            wire.write_line(entry.content_hash()).await?;
            wire.write_line("").await?;
        }
        wire.write_line(END_FILE_INDEX).await?;
        match wire.read_line().await?.as_str() {
            END_FILE_INDEX_OK => {}
            FILE_INDEX_INVALID => {
                return Err(WireError::protocol(format!(
                    "slave rejected the file index of '{}'",
                    self.name
                )));
            }
            other => return Err(WireError::unexpected(END_FILE_INDEX_OK, other)),
        }

        files.send_requested(wire).await
    }
}

/// Append-only, ordered record of every compiled command of the current scene.
#[derive(Debug, Default)]
pub struct CommandLog {
    commands: Vec<CompiledCommand>,
    complete: bool,
}

impl CommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles and appends one command. Appending the flush trigger marks the log complete.
    pub fn append(
        &mut self,
        files: &mut FileRegistry,
        name: &str,
        args: &CommandArgs,
        file_params: &[&str],
    ) -> anyhow::Result<&CompiledCommand> {
        let compiled = CompiledCommand::compile(name, args, files, file_params)?;
        if name == FLUSH_TRIGGER {
            self.complete = true;
        }
        self.commands.push(compiled);
        Ok(&self.commands[self.commands.len() - 1])
    }

    /// The scene description is complete and ready to be flushed.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn set_complete(&mut self, complete: bool) {
        self.complete = complete;
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompiledCommand> {
        self.commands.iter()
    }

    /// Streams every command in append order. Only for slaves that have not seen the log.
    pub async fn replay<S>(&self, files: &mut FileRegistry, wire: &mut Wire<S>) -> WireResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        for command in &self.commands {
            tracing::debug!("Replaying '{}'", command.name);
            command.send(wire, files).await?;
        }
        wire.flush().await
    }
}
