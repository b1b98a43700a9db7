// ABOUTME: Version, file-extension, and bytecode-format constants shared across the crate

/// Crate version reported by the CLI's `--version` flag.
pub const VERSION: &str = "1.0.0";

/// Source file extension for both programs and units.
pub const SOURCE_EXT: &str = "pas";

/// Compiled bytecode extension for a standalone program.
pub const PROGRAM_BYTECODE_EXT: &str = "pbc";

/// Compiled bytecode extension for a unit.
pub const UNIT_BYTECODE_EXT: &str = "pbu";

/// Magic number opening every `.pbc` file: ASCII "PASC".
pub const PROGRAM_MAGIC: u32 = 0x5041_5343;

/// Magic number opening every `.pbu` file: ASCII "PASU".
pub const UNIT_MAGIC: u32 = 0x5041_5355;

/// Current bytecode format version. Bumped whenever the binary layout
/// changes in a way older readers can't tolerate.
pub const BYTECODE_VERSION: u16 = 1;

/// Default directory searched for a `uses`d unit when it isn't found
/// alongside the importing file.
pub const DEFAULT_UNIT_SEARCH_PATH: &str = "./units";
