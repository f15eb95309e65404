use super::codec::{PARAMS_COMPRESSION, Wire, compress, decompress};
use super::error::{WireError, WireResult};
use crate::scene::params::ParamSet;
use tokio::io::{AsyncRead, AsyncWrite};

/// Appending this command completes the scene and triggers a flush to every worker.
pub const FLUSH_TRIGGER: &str = "luxWorldEnd";

/// How the plain fields of a scene command are laid out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgShape {
    Empty,
    Name,
    Floats(usize),
    FloatList,
    NamedParams,
    IdNamedParams,
    Texture,
    MotionInstance,
}

impl ArgShape {
    pub fn has_params(self) -> bool {
        matches!(
            self,
            ArgShape::NamedParams | ArgShape::IdNamedParams | ArgShape::Texture
        )
    }
}

/// Every replayable scene API call and its argument shape.
pub const SCENE_COMMANDS: &[(&str, ArgShape)] = &[
    ("luxIdentity", ArgShape::Empty),
    ("luxWorldBegin", ArgShape::Empty),
    ("luxWorldEnd", ArgShape::Empty),
    ("luxAttributeBegin", ArgShape::Empty),
    ("luxAttributeEnd", ArgShape::Empty),
    ("luxTransformBegin", ArgShape::Empty),
    ("luxTransformEnd", ArgShape::Empty),
    ("luxReverseOrientation", ArgShape::Empty),
    ("luxObjectEnd", ArgShape::Empty),
    ("luxMotionEnd", ArgShape::Empty),
    ("luxCoordinateSystem", ArgShape::Name),
    ("luxCoordSysTransform", ArgShape::Name),
    ("luxNamedMaterial", ArgShape::Name),
    ("luxExterior", ArgShape::Name),
    ("luxInterior", ArgShape::Name),
    ("luxObjectBegin", ArgShape::Name),
    ("luxObjectInstance", ArgShape::Name),
    ("luxPortalInstance", ArgShape::Name),
    ("luxTranslate", ArgShape::Floats(3)),
    ("luxScale", ArgShape::Floats(3)),
    ("luxRotate", ArgShape::Floats(4)),
    ("luxLookAt", ArgShape::Floats(9)),
    ("luxTransform", ArgShape::Floats(16)),
    ("luxConcatTransform", ArgShape::Floats(16)),
    ("luxSetEpsilon", ArgShape::Floats(2)),
    ("luxMotionBegin", ArgShape::FloatList),
    ("luxPixelFilter", ArgShape::NamedParams),
    ("luxFilm", ArgShape::NamedParams),
    ("luxSampler", ArgShape::NamedParams),
    ("luxAccelerator", ArgShape::NamedParams),
    ("luxSurfaceIntegrator", ArgShape::NamedParams),
    ("luxVolumeIntegrator", ArgShape::NamedParams),
    ("luxCamera", ArgShape::NamedParams),
    ("luxMaterial", ArgShape::NamedParams),
    ("luxMakeNamedMaterial", ArgShape::NamedParams),
    ("luxLightGroup", ArgShape::NamedParams),
    ("luxLightSource", ArgShape::NamedParams),
    ("luxAreaLightSource", ArgShape::NamedParams),
    ("luxPortalShape", ArgShape::NamedParams),
    ("luxShape", ArgShape::NamedParams),
    ("luxVolume", ArgShape::NamedParams),
    ("luxRenderer", ArgShape::NamedParams),
    ("luxMakeNamedVolume", ArgShape::IdNamedParams),
    ("luxTexture", ArgShape::Texture),
    ("luxMotionInstance", ArgShape::MotionInstance),
];

pub fn shape_of(command: &str) -> Option<ArgShape> {
    SCENE_COMMANDS
        .iter()
        .find(|(name, _)| *name == command)
        .map(|(_, shape)| *shape)
}

/// Parameter names that may reference a local file for the given command.
pub fn file_params_for(command: &str) -> &'static [&'static str] {
    match command {
        "luxTexture" => &["filename"],
        "luxFilm" => &["mapname", "iesname", "configfile", "usersamplingmap_filename"],
        _ if shape_of(command).is_some_and(ArgShape::has_params) => &[
            "mapname",
            "iesname",
            "configfile",
            "usersamplingmap_filename",
            "filename",
        ],
        _ => &[],
    }
}

/// Decoded arguments of one scene command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandArgs {
    Empty,
    Name(String),
    Floats(Vec<f32>),
    FloatList(Vec<f32>),
    Named {
        name: String,
        params: ParamSet,
    },
    IdNamed {
        id: String,
        name: String,
        params: ParamSet,
    },
    Texture {
        name: String,
        kind: String,
        texname: String,
        params: ParamSet,
    },
    MotionInstance {
        name: String,
        start: f32,
        stop: f32,
        transform: String,
    },
}

impl CommandArgs {
    pub fn named(name: impl Into<String>, params: ParamSet) -> Self {
        CommandArgs::Named {
            name: name.into(),
            params,
        }
    }

    pub fn shape(&self) -> ArgShape {
        match self {
            CommandArgs::Empty => ArgShape::Empty,
            CommandArgs::Name(_) => ArgShape::Name,
            CommandArgs::Floats(values) => ArgShape::Floats(values.len()),
            CommandArgs::FloatList(_) => ArgShape::FloatList,
            CommandArgs::Named { .. } => ArgShape::NamedParams,
            CommandArgs::IdNamed { .. } => ArgShape::IdNamedParams,
            CommandArgs::Texture { .. } => ArgShape::Texture,
            CommandArgs::MotionInstance { .. } => ArgShape::MotionInstance,
        }
    }

    pub fn params(&self) -> Option<&ParamSet> {
        match self {
            CommandArgs::Named { params, .. }
            | CommandArgs::IdNamed { params, .. }
            | CommandArgs::Texture { params, .. } => Some(params),
            _ => None,
        }
    }

    pub fn params_mut(&mut self) -> Option<&mut ParamSet> {
        match self {
            CommandArgs::Named { params, .. }
            | CommandArgs::IdNamed { params, .. }
            | CommandArgs::Texture { params, .. } => Some(params),
            _ => None,
        }
    }

    /// The first name field, when the shape has one.
    pub fn name(&self) -> Option<&str> {
        match self {
            CommandArgs::Name(name)
            | CommandArgs::Named { name, .. }
            | CommandArgs::Texture { name, .. }
            | CommandArgs::IdNamed { name, .. }
            | CommandArgs::MotionInstance { name, .. } => Some(name),
            _ => None,
        }
    }

    fn text_fields(&self) -> Vec<&str> {
        match self {
            CommandArgs::Name(name) | CommandArgs::Named { name, .. } => vec![name],
            CommandArgs::IdNamed { id, name, .. } => vec![id, name],
            CommandArgs::Texture {
                name,
                kind,
                texname,
                ..
            } => vec![name, kind, texname],
            CommandArgs::MotionInstance {
                name, transform, ..
            } => vec![name, transform],
            _ => Vec::new(),
        }
    }

    /// Plain field lines written between the command name and the parameter blob.
    pub fn plain_fields(&self) -> String {
        match self {
            CommandArgs::Empty => String::new(),
            CommandArgs::Floats(values) => format!("{}\n", join_floats(values)),
            CommandArgs::FloatList(values) => {
                if values.is_empty() {
                    "0\n".to_string()
                } else {
                    format!("{} {}\n", values.len(), join_floats(values))
                }
            }
            CommandArgs::MotionInstance {
                name,
                start,
                stop,
                transform,
            } => format!("{name}\n{start} {stop}\n{transform}\n"),
            other => other
                .text_fields()
                .iter()
                .map(|field| format!("{field}\n"))
                .collect(),
        }
    }
}

fn join_floats(values: &[f32]) -> String {
    values
        .iter()
        .map(f32::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// A fully decoded command, ready to be applied to a scene.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneCommand {
    pub name: String,
    pub args: CommandArgs,
}

impl SceneCommand {
    pub fn new(name: impl Into<String>, args: CommandArgs) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// Checks that `args` match the wire layout `command` is decoded with.
pub fn validate(command: &str, args: &CommandArgs) -> WireResult<()> {
    let expected = shape_of(command)
        .ok_or_else(|| WireError::protocol(format!("unknown scene command '{}'", command)))?;
    if expected != args.shape() {
        return Err(WireError::protocol(format!(
            "'{}' expects {:?} arguments, got {:?}",
            command,
            expected,
            args.shape()
        )));
    }
    if args
        .text_fields()
        .iter()
        .any(|field| field.contains('\n') || field.contains('\r'))
    {
        return Err(WireError::protocol(format!(
            "'{}' has a field containing a line break",
            command
        )));
    }
    Ok(())
}

pub fn encode_params(params: &ParamSet) -> WireResult<Vec<u8>> {
    let raw = bincode::serialize(params)?;
    compress(&raw, PARAMS_COMPRESSION)
}

pub fn decode_params(blob: &[u8]) -> WireResult<ParamSet> {
    Ok(bincode::deserialize(&decompress(blob)?)?)
}

fn parse_floats(line: &str) -> WireResult<Vec<f32>> {
    line.split_whitespace()
        .map(|token| {
            token
                .parse::<f32>()
                .map_err(|_| WireError::protocol(format!("invalid float '{}'", token)))
        })
        .collect()
}

/// Reads the plain fields (and the parameter blob, if the shape has one) of a command
/// whose name has already been consumed. The file index is left on the stream.
pub async fn read_args<S>(wire: &mut Wire<S>, shape: ArgShape) -> WireResult<CommandArgs>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let args = match shape {
        ArgShape::Empty => CommandArgs::Empty,
        ArgShape::Name => CommandArgs::Name(wire.read_line().await?),
        ArgShape::Floats(count) => {
            let values = parse_floats(&wire.read_line().await?)?;
            if values.len() != count {
                return Err(WireError::protocol(format!(
                    "expected {} floats, got {}",
                    count,
                    values.len()
                )));
            }
            CommandArgs::Floats(values)
        }
        ArgShape::FloatList => {
            let mut values = parse_floats(&wire.read_line().await?)?;
            if values.is_empty() {
                return Err(WireError::protocol("missing float list count"));
            }
            let count = values.remove(0);
            if count < 0.0 || count as usize != values.len() {
                return Err(WireError::protocol(format!(
                    "float list announces {} values, got {}",
                    count,
                    values.len()
                )));
            }
            CommandArgs::FloatList(values)
        }
        ArgShape::NamedParams => CommandArgs::Named {
            name: wire.read_line().await?,
            params: decode_params(&wire.read_blob().await?)?,
        },
        ArgShape::IdNamedParams => {
            let id = wire.read_line().await?;
            let name = wire.read_line().await?;
            CommandArgs::IdNamed {
                id,
                name,
                params: decode_params(&wire.read_blob().await?)?,
            }
        }
        ArgShape::Texture => {
            let name = wire.read_line().await?;
            let kind = wire.read_line().await?;
            let texname = wire.read_line().await?;
            CommandArgs::Texture {
                name,
                kind,
                texname,
                params: decode_params(&wire.read_blob().await?)?,
            }
        }
        ArgShape::MotionInstance => {
            let name = wire.read_line().await?;
            let times = parse_floats(&wire.read_line().await?)?;
            let [start, stop] = times[..] else {
                return Err(WireError::protocol("motion instance expects two times"));
            };
            CommandArgs::MotionInstance {
                name,
                start,
                stop,
                transform: wire.read_line().await?,
            }
        }
    };
    Ok(args)
}
