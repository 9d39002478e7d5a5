/// Quantization of a downloadable build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quant {
    /// Unquantized weights (BF16/F16).
    Full,
    /// 8-bit (Q8_0).
    Q8,
    /// Mixed 4-bit float used by the gpt-oss releases.
    Mxfp4,
}

impl Quant {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Quant::Full => "BF16",
            Quant::Q8 => "Q8_0",
            Quant::Mxfp4 => "MXFP4",
        }
    }

    /// Suffix appended to derived ids. Ids are user-visible and stable, so
    /// this mapping must never change for existing quantizations.
    #[must_use]
    pub fn id_suffix(self) -> &'static str {
        match self {
            Quant::Full => "",
            Quant::Q8 => "-q8",
            Quant::Mxfp4 => "-mxfp4",
        }
    }

    #[must_use]
    pub fn is_full_precision(self) -> bool {
        matches!(self, Quant::Full)
    }
}

/// One downloadable artifact of a model variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelBuild {
    /// Explicit id. When `None` the id derives from family, variant and
    /// quantization.
    pub id: Option<&'static str>,
    pub quant: Quant,
    /// Total weight size in bytes, all shards included.
    pub file_size: u64,
    /// Estimated KV-cache bytes per 1024 tokens of context.
    pub kv_cache_per_1k: u64,
    /// Primary weight file.
    pub url: &'static str,
    /// Additional weight shards that must sit next to the primary file
    /// before the engine can load the model.
    pub shard_urls: &'static [&'static str],
    /// Multimodal projector downloaded alongside the weights. Builds of the
    /// same variant typically share one.
    pub mmproj_url: Option<&'static str>,
    pub mmproj_size: u64,
    /// Build-specific server flags, appended after family and variant flags.
    pub extra_args: &'static [&'static str],
}

/// A parameter-count tier within a family.
#[derive(Debug, Clone, Copy)]
pub struct ModelVariant {
    pub label: &'static str,
    /// Release date, `YYYY-MM-DD`.
    pub released: &'static str,
    /// Maximum context length the architecture supports.
    pub max_context: u32,
    /// Server flags applied to every build under this variant.
    pub args: &'static [&'static str],
    pub builds: &'static [ModelBuild],
}

/// A named model lineage.
#[derive(Debug, Clone, Copy)]
pub struct ModelFamily {
    pub name: &'static str,
    /// Icon/series key for presentation.
    pub series: &'static str,
    pub blurb: &'static str,
    /// Server flags applied to every variant and build beneath.
    pub args: &'static [&'static str],
    pub variants: &'static [ModelVariant],
}

/// Flattened view of one build, the unit the rest of the app operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub id: String,
    pub family: String,
    pub variant: String,
    pub series: String,
    pub blurb: String,
    pub quant: Quant,
    pub released: String,
    pub max_context: u32,
    pub file_size: u64,
    pub kv_cache_per_1k: u64,
    pub url: String,
    pub shard_urls: Vec<String>,
    pub mmproj_url: Option<String>,
    pub mmproj_size: u64,
    /// Family args, then variant args, then build args. Order matters:
    /// later flags override earlier ones positionally.
    pub server_args: Vec<String>,
}

impl CatalogEntry {
    fn from_build(family: &ModelFamily, variant: &ModelVariant, build: &ModelBuild) -> Self {
        let id = match build.id {
            Some(id) => id.to_string(),
            None => format!(
                "{}-{}{}",
                slug(family.name),
                slug(variant.label),
                build.quant.id_suffix()
            ),
        };

        let server_args = family
            .args
            .iter()
            .chain(variant.args)
            .chain(build.extra_args)
            .map(|s| (*s).to_string())
            .collect();

        Self {
            id,
            family: family.name.to_string(),
            variant: variant.label.to_string(),
            series: family.series.to_string(),
            blurb: family.blurb.to_string(),
            quant: build.quant,
            released: variant.released.to_string(),
            max_context: variant.max_context,
            file_size: build.file_size,
            kv_cache_per_1k: build.kv_cache_per_1k,
            url: build.url.to_string(),
            shard_urls: build.shard_urls.iter().map(|s| (*s).to_string()).collect(),
            mmproj_url: build.mmproj_url.map(str::to_string),
            mmproj_size: build.mmproj_size,
            server_args,
        }
    }

    /// Human-readable name for menus and the server alias.
    #[must_use]
    pub fn display_name(&self) -> String {
        if self.quant.is_full_precision() {
            format!("{} {}", self.family, self.variant)
        } else {
            format!("{} {} ({})", self.family, self.variant, self.quant.label())
        }
    }

    /// Total bytes on disk once fully downloaded, projector included.
    #[must_use]
    pub fn download_size(&self) -> u64 {
        self.file_size + self.mmproj_size
    }

    /// Weight URLs only: primary first, then shards.
    #[must_use]
    pub fn weight_urls(&self) -> Vec<&str> {
        let mut urls = vec![self.url.as_str()];
        urls.extend(self.shard_urls.iter().map(String::as_str));
        urls
    }

    /// Every remote file required before the engine can load this model.
    #[must_use]
    pub fn remote_urls(&self) -> Vec<&str> {
        let mut urls = self.weight_urls();
        if let Some(mmproj) = &self.mmproj_url {
            urls.push(mmproj.as_str());
        }
        urls
    }
}

/// Flatten the nested family tree into catalog entries, in declaration order.
#[must_use]
pub fn flatten(families: &[ModelFamily]) -> Vec<CatalogEntry> {
    let mut entries = Vec::new();
    for family in families {
        for variant in family.variants {
            for build in variant.builds {
                entries.push(CatalogEntry::from_build(family, variant, build));
            }
        }
    }
    entries
}

/// Lowercase, non-alphanumeric runs collapsed to a single `-`.
fn slug(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}
