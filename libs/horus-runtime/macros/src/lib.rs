use proc_macro::TokenStream;
use proc_macro_crate::{FoundCrate, crate_name};
use proc_macro2::Span;
use quote::quote;
use syn::{Ident, ItemFn, parse_macro_input};

/// Runs an async `main` to completion on the current thread's horus event loop.
#[proc_macro_attribute]
pub fn main(_args: TokenStream, input: TokenStream) -> TokenStream {
    let input_fn = parse_macro_input!(input as ItemFn);
    if let Err(err) = require_async(&input_fn, "main") {
        return err.to_compile_error().into();
    }

    let fn_name = &input_fn.sig.ident;
    let fn_body = &input_fn.block;
    let fn_vis = &input_fn.vis;
    let fn_attrs = &input_fn.attrs;
    let fn_generics = &input_fn.sig.generics;
    let fn_inputs = &input_fn.sig.inputs;
    let fn_output = &input_fn.sig.output;
    let runtime = runtime_crate_name();

    let result = quote! {
        #(#fn_attrs)*
        #fn_vis fn #fn_name #fn_generics(#fn_inputs) #fn_output {
            #runtime::run(move || async move #fn_body)
        }
    };

    result.into()
}

/// Turns an async function into a `#[test]` driven by a fresh horus event loop.
///
/// The test may return anything a regular `#[test]` may return, such as `Result<(), E>`.
#[proc_macro_attribute]
pub fn test(_args: TokenStream, input: TokenStream) -> TokenStream {
    let input_fn = parse_macro_input!(input as ItemFn);
    if let Err(err) = require_async(&input_fn, "test") {
        return err.to_compile_error().into();
    }
    if !input_fn.sig.inputs.is_empty() {
        return syn::Error::new_spanned(
            &input_fn.sig.inputs,
            "#[horus_runtime::test] functions cannot take arguments",
        )
        .to_compile_error()
        .into();
    }

    let fn_name = &input_fn.sig.ident;
    let fn_body = &input_fn.block;
    let fn_vis = &input_fn.vis;
    let fn_attrs = &input_fn.attrs;
    let fn_generics = &input_fn.sig.generics;
    let fn_output = &input_fn.sig.output;
    let runtime = runtime_crate_name();

    let result = quote! {
        #[::core::prelude::v1::test]
        #(#fn_attrs)*
        #fn_vis fn #fn_name #fn_generics() #fn_output {
            #runtime::run(move || async move #fn_body)
        }
    };

    result.into()
}

fn require_async(input_fn: &ItemFn, attr: &str) -> Result<(), syn::Error> {
    if input_fn.sig.asyncness.is_some() {
        return Ok(());
    }
    Err(syn::Error::new_spanned(
        &input_fn.sig,
        format!("the #[horus_runtime::{attr}] attribute can only be applied to async functions"),
    ))
}

pub(crate) fn runtime_crate_name() -> proc_macro2::TokenStream {
    let name = crate_name("horus-runtime").expect("horus-runtime is present in `Cargo.toml`");

    match name {
        FoundCrate::Itself => quote!(crate),
        FoundCrate::Name(name) => {
            let ident = Ident::new(&name, Span::call_site());
            quote!( #ident )
        }
    }
}
