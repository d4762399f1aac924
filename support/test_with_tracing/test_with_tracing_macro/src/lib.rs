// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Implementation of `test_with_tracing::test`.

use quote::quote;
use syn::Error;
use syn::ItemFn;
use syn::parse_macro_input;
use syn::spanned::Spanned;

/// Like `#[test]`, but installs the `tracing` subscriber before the body runs.
///
/// The test function must be synchronous and take no arguments. It may return
/// anything `#[test]` accepts.
#[proc_macro_attribute]
pub fn test(
    _attr: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let item = parse_macro_input!(item as ItemFn);
    wrap(item).unwrap_or_else(|err| err.to_compile_error()).into()
}

fn wrap(item: ItemFn) -> syn::Result<proc_macro2::TokenStream> {
    let sig = &item.sig;
    if let Some(asyncness) = &sig.asyncness {
        return Err(Error::new(asyncness.span(), "async tests are not supported"));
    }
    if !sig.inputs.is_empty() {
        return Err(Error::new(sig.inputs.span(), "test functions take no arguments"));
    }

    let name = &sig.ident;
    let output = &sig.output;
    let attrs = &item.attrs;
    let vis = &item.vis;
    let block = &item.block;

    Ok(quote! {
        #[::core::prelude::v1::test]
        #(#attrs)*
        #vis fn #name() #output {
            ::test_with_tracing::init();
            #block
        }
    })
}
