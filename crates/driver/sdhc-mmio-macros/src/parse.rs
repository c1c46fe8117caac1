//! Parsing of the `register_block!` DSL.

use syn::parse::{Parse, ParseStream};
use syn::{Attribute, Ident, LitInt, Token, Visibility, braced, bracketed};

/// A complete register bank definition.
pub struct RegisterBlock {
    /// Attributes (docs) placed on the generated struct.
    pub attrs: Vec<Attribute>,
    /// Visibility of the generated struct.
    pub vis: Visibility,
    /// Name of the generated struct.
    pub name: Ident,
    /// Registers in declaration order.
    pub registers: Vec<RegisterDef>,
}

/// How software may access a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// `ro`: reader only.
    ReadOnly,
    /// `wo`: writer only.
    WriteOnly,
    /// `rw`: reader and writer.
    ReadWrite,
    /// `rw1c`: reader plus a `clear_*` method; writing a 1 clears that bit.
    ReadWriteOneClear,
}

/// A single 32-bit register.
pub struct RegisterDef {
    /// Attributes (docs) placed on the reader.
    pub attrs: Vec<Attribute>,
    /// Byte offset from the bank base.
    pub offset: LitInt,
    /// Access mode.
    pub access: AccessMode,
    /// Register name, used for method names.
    pub name: Ident,
    /// Optional bitflags type used in place of `u32`.
    pub bitflags_type: Option<Ident>,
}

impl Parse for RegisterBlock {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let attrs = input.call(Attribute::parse_outer)?;
        let vis: Visibility = input.parse()?;
        let name: Ident = input.parse()?;

        let content;
        braced!(content in input);

        let mut registers: Vec<RegisterDef> = Vec::new();
        while !content.is_empty() {
            let reg = content.call(parse_register)?;
            if registers.iter().any(|r| r.name == reg.name) {
                return Err(syn::Error::new(reg.name.span(), "duplicate register name"));
            }
            registers.push(reg);
        }

        Ok(Self {
            attrs,
            vis,
            name,
            registers,
        })
    }
}

/// Parses `[offset; access] name => Type,`.
fn parse_register(input: ParseStream) -> syn::Result<RegisterDef> {
    let attrs = input.call(Attribute::parse_outer)?;

    let bracket_content;
    bracketed!(bracket_content in input);

    let offset: LitInt = bracket_content.parse()?;
    let value: u32 = offset.base10_parse()?;
    if value % 4 != 0 {
        return Err(syn::Error::new(
            offset.span(),
            "register offset must be 32-bit aligned",
        ));
    }

    bracket_content.parse::<Token![;]>()?;

    let access_ident: Ident = bracket_content.parse()?;
    let access = match access_ident.to_string().as_str() {
        "ro" => AccessMode::ReadOnly,
        "wo" => AccessMode::WriteOnly,
        "rw" => AccessMode::ReadWrite,
        "rw1c" => AccessMode::ReadWriteOneClear,
        _ => {
            return Err(syn::Error::new(
                access_ident.span(),
                "expected access mode: ro, wo, rw, or rw1c",
            ));
        }
    };

    let name: Ident = input.parse()?;

    let bitflags_type = if input.peek(Token![=>]) {
        input.parse::<Token![=>]>()?;
        Some(input.parse::<Ident>()?)
    } else {
        None
    };

    let _ = input.parse::<Option<Token![,]>>()?;

    Ok(RegisterDef {
        attrs,
        offset,
        access,
        name,
        bitflags_type,
    })
}
