use crate::catalog::entry::{flatten, CatalogEntry, ModelBuild, ModelFamily, ModelVariant, Quant};
use crate::catalog::fit;
use crate::system;

/// Curated model families offered by the menu.
///
/// Ids derived from these names are user-visible and stable; renaming a
/// display field must never change an id (see [`Quant::id_suffix`]).
pub const FAMILIES: &[ModelFamily] = &[
    ModelFamily {
        name: "Qwen3 2507",
        series: "qwen",
        blurb: "Alibaba's July 2025 Qwen3 instruct refresh",
        args: &["--temp", "0.7", "--top-p", "0.8", "--top-k", "20", "--min-p", "0"],
        variants: &[
            ModelVariant {
                label: "4B",
                released: "2025-08-06",
                max_context: 262_144,
                args: &[],
                builds: &[
                    ModelBuild {
                        id: None,
                        quant: Quant::Full,
                        file_size: 8_051_000_000,
                        kv_cache_per_1k: 150_994_944,
                        url: "https://huggingface.co/unsloth/Qwen3-4B-Instruct-2507-GGUF/resolve/main/Qwen3-4B-Instruct-2507-BF16.gguf",
                        shard_urls: &[],
                        mmproj_url: None,
                        mmproj_size: 0,
                        extra_args: &[],
                    },
                    ModelBuild {
                        id: None,
                        quant: Quant::Q8,
                        file_size: 4_280_000_000,
                        kv_cache_per_1k: 150_994_944,
                        url: "https://huggingface.co/unsloth/Qwen3-4B-Instruct-2507-GGUF/resolve/main/Qwen3-4B-Instruct-2507-Q8_0.gguf",
                        shard_urls: &[],
                        mmproj_url: None,
                        mmproj_size: 0,
                        extra_args: &[],
                    },
                ],
            },
            ModelVariant {
                label: "30B",
                released: "2025-07-29",
                max_context: 262_144,
                args: &[],
                builds: &[
                    ModelBuild {
                        id: None,
                        quant: Quant::Full,
                        file_size: 61_100_000_000,
                        kv_cache_per_1k: 100_663_296,
                        url: "https://huggingface.co/unsloth/Qwen3-30B-A3B-Instruct-2507-GGUF/resolve/main/Qwen3-30B-A3B-Instruct-2507-BF16-00001-of-00002.gguf",
                        shard_urls: &[
                            "https://huggingface.co/unsloth/Qwen3-30B-A3B-Instruct-2507-GGUF/resolve/main/Qwen3-30B-A3B-Instruct-2507-BF16-00002-of-00002.gguf",
                        ],
                        mmproj_url: None,
                        mmproj_size: 0,
                        extra_args: &[],
                    },
                    ModelBuild {
                        id: None,
                        quant: Quant::Q8,
                        file_size: 32_500_000_000,
                        kv_cache_per_1k: 100_663_296,
                        url: "https://huggingface.co/unsloth/Qwen3-30B-A3B-Instruct-2507-GGUF/resolve/main/Qwen3-30B-A3B-Instruct-2507-Q8_0.gguf",
                        shard_urls: &[],
                        mmproj_url: None,
                        mmproj_size: 0,
                        extra_args: &["--cache-type-k", "q8_0", "--cache-type-v", "q8_0"],
                    },
                ],
            },
        ],
    },
    ModelFamily {
        name: "gpt-oss",
        series: "openai",
        blurb: "OpenAI's open-weight reasoning models",
        args: &["--reasoning-format", "auto"],
        variants: &[
            ModelVariant {
                label: "20B",
                released: "2025-08-05",
                max_context: 131_072,
                args: &[],
                builds: &[ModelBuild {
                    id: Some("gpt-oss-20b"),
                    quant: Quant::Mxfp4,
                    file_size: 12_110_000_000,
                    kv_cache_per_1k: 50_331_648,
                    url: "https://huggingface.co/ggml-org/gpt-oss-20b-GGUF/resolve/main/gpt-oss-20b-mxfp4.gguf",
                    shard_urls: &[],
                    mmproj_url: None,
                    mmproj_size: 0,
                    extra_args: &[],
                }],
            },
            ModelVariant {
                label: "120B",
                released: "2025-08-05",
                max_context: 131_072,
                args: &[],
                builds: &[ModelBuild {
                    id: Some("gpt-oss-120b"),
                    quant: Quant::Mxfp4,
                    file_size: 63_400_000_000,
                    kv_cache_per_1k: 75_497_472,
                    url: "https://huggingface.co/ggml-org/gpt-oss-120b-GGUF/resolve/main/gpt-oss-120b-mxfp4-00001-of-00003.gguf",
                    shard_urls: &[
                        "https://huggingface.co/ggml-org/gpt-oss-120b-GGUF/resolve/main/gpt-oss-120b-mxfp4-00002-of-00003.gguf",
                        "https://huggingface.co/ggml-org/gpt-oss-120b-GGUF/resolve/main/gpt-oss-120b-mxfp4-00003-of-00003.gguf",
                    ],
                    mmproj_url: None,
                    mmproj_size: 0,
                    extra_args: &[],
                }],
            },
        ],
    },
    ModelFamily {
        name: "Gemma 3",
        series: "gemma",
        blurb: "Google's multimodal Gemma 3 line",
        args: &["--repeat-penalty", "1.0"],
        variants: &[
            ModelVariant {
                label: "4B",
                released: "2025-03-12",
                max_context: 131_072,
                args: &[],
                builds: &[
                    ModelBuild {
                        id: None,
                        quant: Quant::Full,
                        file_size: 7_770_000_000,
                        kv_cache_per_1k: 142_606_336,
                        url: "https://huggingface.co/bartowski/google_gemma-3-4b-it-GGUF/resolve/main/google_gemma-3-4b-it-bf16.gguf",
                        shard_urls: &[],
                        mmproj_url: Some("https://huggingface.co/bartowski/google_gemma-3-4b-it-GGUF/resolve/main/mmproj-google_gemma-3-4b-it-f16.gguf"),
                        mmproj_size: 851_000_000,
                        extra_args: &[],
                    },
                    ModelBuild {
                        id: None,
                        quant: Quant::Q8,
                        file_size: 4_130_000_000,
                        kv_cache_per_1k: 142_606_336,
                        url: "https://huggingface.co/bartowski/google_gemma-3-4b-it-GGUF/resolve/main/google_gemma-3-4b-it-Q8_0.gguf",
                        shard_urls: &[],
                        mmproj_url: Some("https://huggingface.co/bartowski/google_gemma-3-4b-it-GGUF/resolve/main/mmproj-google_gemma-3-4b-it-f16.gguf"),
                        mmproj_size: 851_000_000,
                        extra_args: &[],
                    },
                ],
            },
            ModelVariant {
                label: "12B",
                released: "2025-03-12",
                max_context: 131_072,
                args: &["--swa-full"],
                builds: &[ModelBuild {
                    id: None,
                    quant: Quant::Q8,
                    file_size: 12_500_000_000,
                    kv_cache_per_1k: 201_326_592,
                    url: "https://huggingface.co/bartowski/google_gemma-3-12b-it-GGUF/resolve/main/google_gemma-3-12b-it-Q8_0.gguf",
                    shard_urls: &[],
                    mmproj_url: Some("https://huggingface.co/bartowski/google_gemma-3-12b-it-GGUF/resolve/main/mmproj-google_gemma-3-12b-it-f16.gguf"),
                    mmproj_size: 854_000_000,
                    extra_args: &[],
                }],
            },
        ],
    },
];

/// Flattened catalog with id lookup.
#[derive(Debug, Clone)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::curated()
    }
}

impl Catalog {
    /// The built-in catalog.
    #[must_use]
    pub fn curated() -> Self {
        Self {
            entries: flatten(FAMILIES),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_entries(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    #[must_use]
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Find entry by id
    #[must_use]
    pub fn find(&self, id: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Entries to show, honoring the show-incompatible setting. Compatibility
    /// is judged at the minimum context floor.
    #[must_use]
    pub fn visible(&self, show_incompatible: bool, total_memory_mb: u64) -> Vec<&CatalogEntry> {
        self.entries
            .iter()
            .filter(|e| show_incompatible || fit::is_compatible(e, fit::MIN_CONTEXT, total_memory_mb))
            .collect()
    }

    /// Entries visible on this machine, per the host memory probe.
    #[must_use]
    pub fn visible_here(&self, show_incompatible: bool) -> Vec<&CatalogEntry> {
        self.visible(show_incompatible, system::total_memory_mb())
    }

    /// Find closest id match using Levenshtein distance
    #[must_use]
    pub fn suggest(&self, id: &str) -> Option<&str> {
        if id.is_empty() {
            return None;
        }

        self.entries
            .iter()
            .map(|e| (e.id.as_str(), levenshtein_distance(id, &e.id)))
            .min_by_key(|(_, dist)| *dist)
            .filter(|(_, dist)| *dist <= 2) // Only suggest if within 2 edits
            .map(|(id, _)| id)
    }
}

/// Calculate Levenshtein distance between two strings
#[allow(clippy::needless_range_loop)]
fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let len1 = s1.chars().count();
    let len2 = s2.chars().count();

    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }

    let mut matrix = vec![vec![0; len2 + 1]; len1 + 1];

    for i in 0..=len1 {
        matrix[i][0] = i;
    }
    for j in 0..=len2 {
        matrix[0][j] = j;
    }

    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();

    for (i, c1) in s1_chars.iter().enumerate() {
        for (j, c2) in s2_chars.iter().enumerate() {
            let cost = usize::from(c1 != c2);
            matrix[i + 1][j + 1] = (matrix[i][j + 1] + 1)
                .min(matrix[i + 1][j] + 1)
                .min(matrix[i][j] + cost);
        }
    }

    matrix[len1][len2]
}
