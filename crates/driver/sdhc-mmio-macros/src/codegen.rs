//! Code generation for `register_block!`.
//!
//! The generated bank holds a shared `sdhc_mmio::IoHandle` plus a base offset
//! and goes through the `RegisterIo` trait for every access, so the same
//! definitions drive real MMIO and the simulated controller used in tests.

use proc_macro2::TokenStream;
use quote::{format_ident, quote};

use crate::parse::{AccessMode, RegisterBlock, RegisterDef};

/// Generates the struct and its accessors.
pub fn generate(block: &RegisterBlock) -> TokenStream {
    let vis = &block.vis;
    let name = &block.name;
    let attrs = &block.attrs;

    let methods: Vec<TokenStream> = block.registers.iter().map(generate_methods).collect();

    quote! {
        #(#attrs)*
        #[derive(Clone)]
        #vis struct #name {
            io: ::sdhc_mmio::IoHandle,
            base: u32,
        }

        impl #name {
            /// Creates an accessor for the bank starting at byte offset `base`.
            #[must_use]
            #vis fn new(io: ::sdhc_mmio::IoHandle, base: u32) -> Self {
                Self { io, base }
            }

            /// Returns the bank's base offset.
            #[must_use]
            #vis fn base(&self) -> u32 {
                self.base
            }

            /// Returns the underlying register I/O handle.
            #[must_use]
            #vis fn io(&self) -> &::sdhc_mmio::IoHandle {
                &self.io
            }

            #(#methods)*
        }
    }
}

fn generate_methods(reg: &RegisterDef) -> TokenStream {
    let mut methods = TokenStream::new();
    if reg.access != AccessMode::WriteOnly {
        methods.extend(generate_read(reg));
    }
    match reg.access {
        AccessMode::WriteOnly | AccessMode::ReadWrite => methods.extend(generate_write(reg)),
        AccessMode::ReadWriteOneClear => methods.extend(generate_clear(reg)),
        AccessMode::ReadOnly => {}
    }
    methods
}

fn generate_read(reg: &RegisterDef) -> TokenStream {
    let name = &reg.name;
    let offset = &reg.offset;
    let attrs = &reg.attrs;

    match &reg.bitflags_type {
        Some(bf_type) => quote! {
            #(#attrs)*
            #[inline]
            #[must_use]
            pub fn #name(&self) -> #bf_type {
                #bf_type::from_bits_retain(
                    ::sdhc_mmio::RegisterIo::read32(&*self.io, self.base + #offset)
                )
            }
        },
        None => quote! {
            #(#attrs)*
            #[inline]
            #[must_use]
            pub fn #name(&self) -> u32 {
                ::sdhc_mmio::RegisterIo::read32(&*self.io, self.base + #offset)
            }
        },
    }
}

fn generate_write(reg: &RegisterDef) -> TokenStream {
    let setter = format_ident!("set_{}", reg.name);
    let doc = format!("Writes the `{}` register.", reg.name);
    emit_writer(reg, &setter, &doc)
}

fn generate_clear(reg: &RegisterDef) -> TokenStream {
    let clearer = format_ident!("clear_{}", reg.name);
    let doc = format!(
        "Clears the given bits of the write-1-to-clear `{}` register.",
        reg.name
    );
    emit_writer(reg, &clearer, &doc)
}

fn emit_writer(reg: &RegisterDef, method: &proc_macro2::Ident, doc: &str) -> TokenStream {
    let offset = &reg.offset;
    match &reg.bitflags_type {
        Some(bf_type) => quote! {
            #[doc = #doc]
            #[inline]
            pub fn #method(&self, value: #bf_type) {
                ::sdhc_mmio::RegisterIo::write32(&*self.io, self.base + #offset, value.bits());
            }
        },
        None => quote! {
            #[doc = #doc]
            #[inline]
            pub fn #method(&self, value: u32) {
                ::sdhc_mmio::RegisterIo::write32(&*self.io, self.base + #offset, value);
            }
        },
    }
}
