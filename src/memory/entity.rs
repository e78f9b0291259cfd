//! Entity classification over grouped subregions.
//!
//! A run of subregions sharing an allocation base becomes one [`Entity`]:
//! a private allocation, a mapped file view, or a loaded executable image.
//! The variant is decided by the first subregion's type; image entities
//! additionally resolve their backing file, parse it, correlate the
//! loader's module list, and consult the signing oracle.

use std::path::PathBuf;
use tracing::{debug, warn};

use crate::error::GostirError;
use crate::memory::subregion::{
    Subregion, SubregionType, SUBREGION_FLAG_HEAP, SUBREGION_FLAG_STACK, SUBREGION_FLAG_TEB,
};
use crate::os::types::{ModuleInfo, SigningInfo};
use crate::os::{OsApi, ProcessAccess};
use crate::pe::MappedImage;
use crate::process::thread::Thread;

/// Everything the builder consults besides the subregions themselves.
pub(crate) struct EntityContext<'a> {
    pub os: &'a dyn OsApi,
    pub process: &'a dyn ProcessAccess,
    pub heaps: &'a [u64],
    pub threads: &'a [Thread],
    pub modules: &'a [ModuleInfo],
}

/// Image-specific metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMeta {
    /// Canonical backing path, when device translation succeeded.
    pub path: Option<PathBuf>,
    /// True when the backing file could not be read. A phantom image has
    /// no parsed view and is itself a strong injection signal.
    pub phantom: bool,
    /// Parsed on-disk view; absent exactly when `phantom` is set.
    pub pe: Option<MappedImage>,
    /// No subregion of the entity carries execute protection.
    pub non_executable: bool,
    /// The declared image size exceeds what is committed in memory.
    pub partially_mapped: bool,
    /// The loader's record for this base, when one exists.
    pub peb_module: Option<ModuleInfo>,
    /// Signing classification of the backing file; unsigned for phantoms.
    pub signing: SigningInfo,
}

/// Classification of one allocation.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityKind {
    Private,
    MappedFile {
        /// Canonical backing path, when device translation succeeded.
        path: Option<PathBuf>,
    },
    Image(Box<ImageMeta>),
}

/// One allocation: an ordered, non-empty run of subregions sharing an
/// allocation base, plus its classification.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    subregions: Vec<Subregion>,
    kind: EntityKind,
}

impl Entity {
    /// Classify a group of subregions. The group must be non-empty and
    /// share one allocation base.
    pub(crate) fn build(
        ctx: &EntityContext<'_>,
        mut subregions: Vec<Subregion>,
    ) -> Result<Self, GostirError> {
        debug_assert!(!subregions.is_empty());
        subregions.sort_by_key(|s| s.base_va());

        let kind = match subregions[0].kind() {
            SubregionType::Image => EntityKind::Image(Box::new(Self::build_image(ctx, &subregions)?)),
            SubregionType::Mapped => EntityKind::MappedFile {
                path: Self::resolve_backing_path(ctx, subregions[0].alloc_base()),
            },
            _ => EntityKind::Private,
        };

        let mut entity = Self { subregions, kind };
        entity.derive_flags(ctx);
        Ok(entity)
    }

    fn resolve_backing_path(ctx: &EntityContext<'_>, base: u64) -> Option<PathBuf> {
        let device = ctx.process.mapped_file_path(base)?;
        let path = ctx.os.translate_device_path(&device);
        if path.is_none() {
            warn!(base, device = %device, "device path translation failed");
        }
        path
    }

    fn build_image(
        ctx: &EntityContext<'_>,
        subregions: &[Subregion],
    ) -> Result<ImageMeta, GostirError> {
        let alloc_base = subregions[0].alloc_base();
        let path = Self::resolve_backing_path(ctx, alloc_base);

        let (pe, phantom) = match &path {
            Some(p) => match ctx.os.read_image_file(p) {
                Ok(bytes) => {
                    let image = MappedImage::from_bytes(bytes).map_err(|source| {
                        GostirError::MalformedImage {
                            path: p.clone(),
                            source,
                        }
                    })?;
                    (Some(image), false)
                }
                Err(err) => {
                    debug!(path = %p.display(), %err, "backing image unreadable, marking phantom");
                    (None, true)
                }
            },
            // No resolvable backing path reads the same as an unreadable
            // file: the image exists only in memory.
            None => (None, true),
        };

        let non_executable = !subregions.iter().any(|s| s.is_executable());

        let committed: u64 = subregions
            .iter()
            .filter(|s| s.is_committed())
            .map(|s| s.size())
            .sum();
        let partially_mapped = pe
            .as_ref()
            .is_some_and(|image| image.size_of_image() > committed);

        let peb_module = ctx.modules.iter().find(|m| m.base == alloc_base).cloned();

        // Phantom images are never presented to the signing oracle; there
        // is no file for it to witness.
        let signing = match (&path, phantom) {
            (Some(p), false) => ctx.os.signing().classify(p),
            _ => SigningInfo::unsigned(),
        };

        Ok(ImageMeta {
            path,
            phantom,
            pe,
            non_executable,
            partially_mapped,
            peb_module,
            signing,
        })
    }

    /// Stamp HEAP/STACK/TEB flags and thread anchors onto each subregion.
    /// Recomputes from scratch, so rebuilding an entity from annotated
    /// subregions reproduces the same annotations.
    fn derive_flags(&mut self, ctx: &EntityContext<'_>) {
        for sub in &mut self.subregions {
            let mut flags = 0u32;
            if ctx.heaps.iter().any(|&h| sub.contains(h)) {
                flags |= SUBREGION_FLAG_HEAP;
            }
            let mut anchors = Vec::new();
            for (index, thread) in ctx.threads.iter().enumerate() {
                if thread.teb().is_some_and(|teb| sub.contains(teb)) {
                    flags |= SUBREGION_FLAG_TEB;
                }
                if thread.stack_pointer().is_some_and(|sp| sub.contains(sp)) {
                    flags |= SUBREGION_FLAG_STACK;
                }
                let anchored = thread.entry_point().is_some_and(|ep| sub.contains(ep))
                    || thread.stack_pointer().is_some_and(|sp| sub.contains(sp));
                if anchored {
                    anchors.push(index);
                }
            }
            sub.set_flags(flags);
            sub.set_thread_refs(anchors);
        }
    }

    /// The allocation base every subregion shares.
    pub fn start_va(&self) -> u64 {
        self.subregions[0].alloc_base()
    }

    /// One past the end of the last subregion.
    pub fn end_va(&self) -> u64 {
        self.subregions.last().map(|s| s.end_va()).unwrap_or(0)
    }

    /// Sum of the subregion sizes.
    pub fn total_size(&self) -> u64 {
        self.subregions.iter().map(|s| s.size()).sum()
    }

    pub fn subregions(&self) -> &[Subregion] {
        &self.subregions
    }

    pub fn subregion_at(&self, base_va: u64) -> Option<&Subregion> {
        self.subregions.iter().find(|s| s.base_va() == base_va)
    }

    pub fn kind(&self) -> &EntityKind {
        &self.kind
    }

    pub fn is_image(&self) -> bool {
        matches!(self.kind, EntityKind::Image(_))
    }

    pub fn image(&self) -> Option<&ImageMeta> {
        match &self.kind {
            EntityKind::Image(meta) => Some(meta),
            _ => None,
        }
    }

    /// Backing path for mapped-file and image entities.
    pub fn backing_path(&self) -> Option<&PathBuf> {
        match &self.kind {
            EntityKind::MappedFile { path } => path.as_ref(),
            EntityKind::Image(meta) => meta.path.as_ref(),
            EntityKind::Private => None,
        }
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start_va() && address < self.end_va()
    }
}
