use std::env;

// CompileConfig — Per-kernel compilation configuration
//
// Every tunable the pipeline consults, carried immutably by the kernel
// from construction. Two environment variables override the config at
// their documented decision points:
//
//   VOLE_FALLBACK=0        fallback off, regardless of the config
//   VOLE_FALLBACK=2        fallback enforced (never compile), unless the
//                          block backend is selected
//   VOLE_DONT_USE_LLVM=1   pick the interpreter over LLVM on CPU

/// Compilation configuration. `Default` gives the production settings.
#[derive(Debug, Clone)]
pub struct CompileConfig {
    /// CUDA pointwise mapping depth: 2 or 3. Values ≤ 0 select the
    /// default of 2.
    pub cuda_pointwise_loop_levels: i64,
    /// Grid size for the 3-level CUDA mapping; ≤ 0 selects 1280.
    pub cuda_pointwise_block_count: i64,
    /// Thread-block size for CUDA mappings; ≤ 0 selects 512 (2-level) or
    /// 256 (3-level).
    pub cuda_pointwise_block_size: i64,
    /// Select the block code generator on CPU.
    pub generate_block_code: bool,
    /// Fail CPU compilation when the LLVM backend is unavailable instead
    /// of falling back to the interpreter.
    pub must_use_llvm_on_cpu: bool,
    /// Emit the conditional-free form of concat.
    pub cat_without_conditionals: bool,
    /// Run the conditional-splitting pass (after inlining, before loop
    /// fusion).
    pub optimize_conditionals: bool,
    /// Allow falling back to the graph interpreter when compilation or a
    /// kernel call fails.
    pub fallback_allowed: bool,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            cuda_pointwise_loop_levels: -1,
            cuda_pointwise_block_count: -1,
            cuda_pointwise_block_size: -1,
            generate_block_code: false,
            must_use_llvm_on_cpu: false,
            cat_without_conditionals: true,
            optimize_conditionals: false,
            fallback_allowed: false,
        }
    }
}

impl CompileConfig {
    pub fn with_cuda_loop_levels(mut self, levels: i64) -> Self {
        self.cuda_pointwise_loop_levels = levels;
        self
    }

    pub fn with_cuda_block_count(mut self, count: i64) -> Self {
        self.cuda_pointwise_block_count = count;
        self
    }

    pub fn with_cuda_block_size(mut self, size: i64) -> Self {
        self.cuda_pointwise_block_size = size;
        self
    }

    pub fn with_block_code(mut self, enabled: bool) -> Self {
        self.generate_block_code = enabled;
        self
    }

    pub fn with_must_use_llvm_on_cpu(mut self, must: bool) -> Self {
        self.must_use_llvm_on_cpu = must;
        self
    }

    pub fn with_cat_without_conditionals(mut self, enabled: bool) -> Self {
        self.cat_without_conditionals = enabled;
        self
    }

    pub fn with_optimize_conditionals(mut self, enabled: bool) -> Self {
        self.optimize_conditionals = enabled;
        self
    }

    pub fn with_fallback_allowed(mut self, allowed: bool) -> Self {
        self.fallback_allowed = allowed;
        self
    }
}

/// Whether a failed compile or call may divert to the fallback path.
pub fn fallback_allowed(config: &CompileConfig) -> bool {
    match env::var("VOLE_FALLBACK") {
        Err(_) => config.fallback_allowed,
        Ok(v) if v == "0" => false,
        Ok(_) => true,
    }
}

/// Whether the fallback path must be taken without attempting to compile
/// (`VOLE_FALLBACK=2`). The block backend always compiles.
pub fn fallback_enforced(config: &CompileConfig) -> bool {
    if config.generate_block_code {
        return false;
    }
    matches!(env::var("VOLE_FALLBACK"), Ok(v) if v == "2")
}

/// Whether the interpreter should be preferred over LLVM on CPU.
pub fn dont_use_llvm() -> bool {
    matches!(env::var("VOLE_DONT_USE_LLVM"), Ok(v) if v == "1")
}
