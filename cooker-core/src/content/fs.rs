//! Plain-file content provider.
//!
//! An item id is a `/`-separated path under the content root. Lines of the
//! form `#<directive> <value>` declare edges and restrictions; every other
//! line is payload copied into the artifact.
//!
//! | directive | meaning |
//! |---|---|
//! | `#import <id>` | hard runtime reference |
//! | `#soft <id>` | soft runtime reference |
//! | `#build <id>` | build dependency, hashed into the cache entry |
//! | `#generate <name>` | generated sub-item `<id>::<name>` |
//! | `#platforms <a>,<b>` | only cookable for the listed platforms |
//! | `#invalid <reason>` | fails validation on save |

use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};

use tracing::trace;

use crate::{
    cook::leaf::{ArtifactMetadata, ArtifactSink, ContentHandle, ContentProvider, LeafError, SaveOutput},
    types::{ContentHash, InputHasher, ItemId, Platform},
};

/// Separator between a parent id and the name of a generated sub-item.
pub const GENERATED_SEPARATOR: &str = "::";

/// Parsed source of one item, held behind a [`ContentHandle`] while loaded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceItem {
    pub imports: Vec<ItemId>,
    pub soft_refs: Vec<ItemId>,
    pub build_deps: Vec<ItemId>,
    pub generated: Vec<ItemId>,
    /// `None` means every platform.
    pub platforms: Option<Vec<Platform>>,
    pub invalid: Option<String>,
    pub payload: Vec<String>,
}

impl SourceItem {
    pub fn parse(id: &ItemId, text: &str) -> Self {
        let mut item = SourceItem::default();
        for line in text.lines() {
            let Some(directive) = line.strip_prefix('#') else {
                item.payload.push(line.to_string());
                continue;
            };
            let (name, value) = directive
                .split_once(char::is_whitespace)
                .map_or((directive, ""), |(name, value)| (name, value.trim()));
            match name {
                "import" if !value.is_empty() => item.imports.push(ItemId::new(value)),
                "soft" if !value.is_empty() => item.soft_refs.push(ItemId::new(value)),
                "build" if !value.is_empty() => item.build_deps.push(ItemId::new(value)),
                "generate" if !value.is_empty() => item
                    .generated
                    .push(ItemId::new(format!("{id}{GENERATED_SEPARATOR}{value}"))),
                "platforms" => item.platforms = Some(Platform::parse_list(value)),
                "invalid" => item.invalid = Some(value.to_string()),
                // unknown directives are comments
                _ => trace!(target: "cook::content", item = %id, directive = name, "ignored directive"),
            }
        }
        item
    }

    pub fn supports(&self, platform: &Platform) -> bool {
        self.platforms
            .as_ref()
            .is_none_or(|platforms| platforms.contains(platform))
    }
}

/// Reads items from a directory tree.
#[derive(Clone, Debug)]
pub struct FsContentProvider {
    root: PathBuf,
}

impl FsContentProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn split_generated(id: &ItemId) -> Option<(ItemId, &str)> {
        id.as_str()
            .split_once(GENERATED_SEPARATOR)
            .map(|(parent, name)| (ItemId::new(parent), name))
    }

    fn source_path(&self, id: &ItemId) -> Result<PathBuf, LeafError> {
        Ok(self.root.join(relative_path(id)?))
    }

    fn read(&self, id: &ItemId) -> Result<Vec<u8>, LeafError> {
        let path = self.source_path(id)?;
        fs::read(&path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => {
                LeafError::Content(format!("missing input {}", path.display()))
            }
            io::ErrorKind::InvalidData | io::ErrorKind::PermissionDenied => {
                LeafError::Content(format!("unreadable input {}: {err}", path.display()))
            }
            _ => LeafError::Transient(format!("reading {}: {err}", path.display())),
        })
    }

    fn parse(&self, id: &ItemId) -> Result<SourceItem, LeafError> {
        if let Some((parent, name)) = Self::split_generated(id) {
            // generated items exist only while their parent does
            self.read(&parent)?;
            return Ok(SourceItem {
                payload: vec![format!("generated {name} from {parent}")],
                ..SourceItem::default()
            });
        }
        let bytes = self.read(id)?;
        let text = String::from_utf8(bytes)
            .map_err(|_| LeafError::Content(format!("{id}: input is not UTF-8")))?;
        Ok(SourceItem::parse(id, &text))
    }
}

impl ContentProvider for FsContentProvider {
    fn load(&self, id: &ItemId) -> Result<ContentHandle, LeafError> {
        self.parse(id).map(ContentHandle::new)
    }

    fn save(
        &self,
        id: &ItemId,
        platform: &Platform,
        content: &ContentHandle,
    ) -> Result<SaveOutput, LeafError> {
        let source = content
            .downcast_ref::<SourceItem>()
            .ok_or_else(|| LeafError::Content(format!("{id}: unexpected content type")))?;
        if !source.supports(platform) {
            return Err(LeafError::NotCookable(format!("{id} is not built for {platform}")));
        }
        if let Some(reason) = &source.invalid {
            return Err(LeafError::Content(format!("{id} failed validation: {reason}")));
        }

        let mut artifact = format!("cooked {id} for {platform}\n");
        for line in &source.payload {
            artifact.push_str(line);
            artifact.push('\n');
        }
        Ok(SaveOutput {
            artifact: artifact.into_bytes(),
            imports: source.imports.clone(),
            soft_refs: source.soft_refs.clone(),
            build_deps: source.build_deps.clone(),
            generated: source.generated.clone(),
        })
    }

    fn dependencies(&self, id: &ItemId) -> Vec<ItemId> {
        self.parse(id)
            .map(|source| source.imports)
            .unwrap_or_default()
    }

    fn hash(&self, id: &ItemId) -> Result<ContentHash, LeafError> {
        match Self::split_generated(id) {
            Some((parent, name)) => {
                let bytes = self.read(&parent)?;
                let mut hasher = InputHasher::new();
                hasher.field(&bytes).field(name.as_bytes());
                Ok(hasher.finish())
            }
            None => Ok(ContentHash::of(&self.read(id)?)),
        }
    }
}

/// Writes artifacts to `<output>/<platform>/<id>` with a JSON metadata
/// sidecar. Re-persisting the same (id, platform) replaces the artifact.
#[derive(Clone, Debug)]
pub struct FsArtifactSink {
    output: PathBuf,
}

impl FsArtifactSink {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
        }
    }

    pub fn artifact_path(&self, id: &ItemId, platform: &Platform) -> Result<PathBuf, LeafError> {
        let relative = relative_path(&ItemId::new(id.as_str().replace(GENERATED_SEPARATOR, "__")))?;
        Ok(self.output.join(platform.as_str()).join(relative))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut partial = path.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);
    fs::write(&partial, bytes)?;
    fs::rename(&partial, path)
}

impl ArtifactSink for FsArtifactSink {
    fn persist(
        &self,
        id: &ItemId,
        platform: &Platform,
        artifact: &[u8],
        metadata: &ArtifactMetadata,
    ) -> Result<(), LeafError> {
        let path = self.artifact_path(id, platform)?;
        let transient = |err: io::Error| LeafError::Transient(format!("writing {}: {err}", path.display()));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(transient)?;
        }
        write_atomic(&path, artifact).map_err(transient)?;

        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(".meta.json");
        let meta = serde_json::to_vec_pretty(metadata)
            .map_err(|err| LeafError::Content(format!("{id}: metadata: {err}")))?;
        write_atomic(Path::new(&sidecar), &meta).map_err(transient)?;
        Ok(())
    }
}

/// Maps an item id onto a relative path, refusing anything that would
/// escape the root.
fn relative_path(id: &ItemId) -> Result<PathBuf, LeafError> {
    let path = Path::new(id.as_str().trim_start_matches('/'));
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || path.as_os_str().is_empty() {
        return Err(LeafError::NotCookable(format!("{id} is not a valid content path")));
    }
    Ok(path.to_path_buf())
}
