//! Proc-macro crate for the `register_block!` register DSL.
//!
//! Generates typed accessors for a bank of 32-bit controller registers. All
//! accesses go through `sdhc_mmio::RegisterIo`, so there is no `unsafe` in
//! the generated code; the unsafety of raw MMIO lives in the backend.

mod codegen;
mod parse;

use proc_macro::TokenStream;
use syn::parse_macro_input;

use crate::parse::RegisterBlock;

/// Generates a register bank struct with typed accessors.
///
/// # Syntax
///
/// ```ignore
/// register_block! {
///     /// Doc comment for the struct.
///     pub BankName {
///         /// Doc comment for the register.
///         [offset; access] name => OptionalBitflagsType,
///     }
/// }
/// ```
///
/// - `offset`: byte offset from the bank base, 32-bit aligned
/// - `access`: `ro`, `wo`, `rw`, or `rw1c` (write-1-to-clear status)
/// - `=> Type`: optional bitflags type (`from_bits_retain` / `.bits()`)
///
/// # Generated Code
///
/// - `ro`/`rw`/`rw1c`: `fn name(&self) -> Type`
/// - `wo`/`rw`: `fn set_name(&self, value: Type)`
/// - `rw1c`: `fn clear_name(&self, value: Type)`
///
/// The struct is built with `Bank::new(io, base)` where `io` is an
/// `sdhc_mmio::IoHandle`.
#[proc_macro]
pub fn register_block(input: TokenStream) -> TokenStream {
    let block = parse_macro_input!(input as RegisterBlock);
    codegen::generate(&block).into()
}
