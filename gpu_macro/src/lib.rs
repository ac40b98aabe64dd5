use std::{collections::HashMap, ffi::CString, str::FromStr};

use proc_macro::{TokenStream, TokenTree};
use quote::{ToTokens, format_ident, quote, quote_spanned};
use syn::{
    ExprCall, FnArg, Ident, Item, ItemFn, ItemMod, LitCStr, Pat, PatIdent, PatType, ReturnType,
    Signature, Type, parse_quote, punctuated::Punctuated, spanned::Spanned,
};

static GPU_TYPES: &str = "one of CUDA, HIP, OneAPI";

struct ProcMacFailure(proc_macro2::TokenStream);

impl From<syn::Error> for ProcMacFailure {
    fn from(value: syn::Error) -> Self {
        Self(value.to_compile_error())
    }
}

fn fail(spanned: impl Spanned, msg: &str) -> ProcMacFailure {
    ProcMacFailure(quote_spanned! {spanned.span()=> compile_error!(#msg); })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TargetType {
    CUDA,
}

impl TargetType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::CUDA => "cuda",
        }
    }
}

fn get_architecture(target: &Ident) -> Result<TargetType, ProcMacFailure> {
    match target.to_string().as_str() {
        "CUDA" => Ok(TargetType::CUDA),
        "HIP" | "OneAPI" => Err(fail(target, "OK, maybe I lied -- only CUDA is supported (for now)")),
        _ => Err(fail(
            target,
            &format!("Invalid GPU target type! Use {GPU_TYPES}"),
        )),
    }
}

struct KernelArg {
    ident: Ident,
    ty: Type,
    ffi_parts: u8,
}

impl KernelArg {
    fn ffi_idents(&self) -> Vec<Ident> {
        (0..self.ffi_parts)
            .map(|part| format_ident!("{}_{}", self.ident, part))
            .collect()
    }

    fn ffi_types(&self) -> Vec<Type> {
        let ty = &self.ty;
        let parts = self.ffi_parts;
        (0..parts)
            .map(|part| {
                parse_quote! {
                    <<#ty as ::gpu_native::gpu_safety::GPUPassable>::FFIRep
                        as ::gpu_native::gpu_safety::TupleIndex<#parts, #part>>::Ty
                }
            })
            .collect()
    }
}

fn get_num_ffi_components(
    specified_types: &Punctuated<ExprCall, syn::Token![;]>,
) -> Result<HashMap<String, u8>, ProcMacFailure> {
    specified_types
        .iter()
        .map(|ec| {
            let type_id = match ec.func.as_ref() {
                syn::Expr::Path(expr_path) => expr_path.to_token_stream().to_string(),
                _ => {
                    return Err(fail(
                        ec,
                        "Must be a simple function-call-like syntax, e.g. `DeviceSlice(2)`",
                    ));
                }
            };
            if ec.args.len() > 1 {
                return Err(fail(
                    ec,
                    "Function call cannot have more than one (integral literal) argument.",
                ));
            }
            let num_ffi_components = match ec.args.first() {
                Some(int_literal) => u8::from_str(&int_literal.to_token_stream().to_string())
                    .map_err(|_| fail(int_literal, "Cannot parse this as an int literal"))?,
                None => 1,
            };
            if !(1..=3).contains(&num_ffi_components) {
                return Err(fail(ec, "Kernel arguments decompose into one to three FFI components."));
            }
            Ok((type_id, num_ffi_components))
        })
        .collect()
}

fn check_signature(sig: &Signature) -> Result<(), ProcMacFailure> {
    if let Some(c) = sig.constness {
        return Err(fail(c, "`const` kernels are not allowed!"));
    }
    if let Some(a) = sig.asyncness {
        return Err(fail(a, "(Rust language feature) `async` kernels are not allowed"));
    }
    if let Some(abi) = &sig.abi {
        return Err(fail(
            abi,
            "Non-native-ABIs are not supported (the kernel becomes an extern \"ptx-kernel\" internally)",
        ));
    }
    if !sig.generics.params.is_empty() {
        return Err(fail(&sig.generics, "Generic kernels are not supported."));
    }
    if let ReturnType::Type(_, ty) = &sig.output {
        return Err(fail(ty, "Kernels cannot return values."));
    }
    Ok(())
}

fn check_arg_type(ty: &Type) -> Result<(), ProcMacFailure> {
    match ty {
        Type::Path(_) | Type::Ptr(_) => Ok(()),
        Type::BareFn(_) => Err(fail(ty, "Closures (and function pointers) are *very* FFI unsafe.")),
        Type::Reference(_) => Err(fail(
            ty,
            "References are not passed correctly to the GPU. Only owned types can be passed.",
        )),
        Type::Slice(_) => Err(fail(
            ty,
            "Slices are not FFI-safe. Try using `slices::DeviceSlice` or something similar.",
        )),
        Type::Tuple(_) => Err(fail(
            ty,
            "Tuples are not supported; decompose them with `GPUPassable` instead.",
        )),
        Type::ImplTrait(_) | Type::TraitObject(_) => Err(fail(
            ty,
            "A concrete type must be given for every kernel argument.",
        )),
        _ => Err(fail(ty, "Unsupported kernel argument type.")),
    }
}

fn get_kernel_args(
    sig: &Signature,
    ident_to_num_ffi: &HashMap<String, u8>,
) -> Result<Vec<KernelArg>, ProcMacFailure> {
    sig.inputs
        .iter()
        .map(|inp| {
            let PatType { pat, ty, .. } = match inp {
                FnArg::Receiver(receiver) => {
                    return Err(fail(receiver, "Kernels are only allowed as free functions."));
                }
                FnArg::Typed(pat_type) => pat_type,
            };
            let ident = match pat.as_ref() {
                Pat::Ident(PatIdent {
                    attrs,
                    by_ref,
                    subpat,
                    ident,
                    ..
                }) => {
                    if let Some(attribute) = attrs.first() {
                        return Err(fail(
                            attribute,
                            "Attributes are not supported *on* variable `ident` tokens.",
                        ));
                    }
                    if let Some(ref_tok) = by_ref {
                        return Err(fail(
                            ref_tok,
                            "Kernels must take arguments directly (i.e. not using `ref`)",
                        ));
                    }
                    if let Some((at, _)) = subpat {
                        return Err(fail(at, "Kernels do not support subpattern argument binding"));
                    }
                    ident.clone()
                }
                _ => {
                    return Err(fail(
                        pat,
                        "Only 'standard' function arguments are accepted, e.g. 'arg: T'",
                    ));
                }
            };
            check_arg_type(ty)?;

            // The longest registered name wins, so `DeviceSliceMut` is not
            // mistaken for `DeviceSlice`.
            let ty_str = ty.to_token_stream().to_string();
            let ffi_parts = ident_to_num_ffi
                .iter()
                .filter(|(known_id, _)| ty_str.contains(known_id.as_str()))
                .max_by_key(|(known_id, _)| known_id.len())
                .map(|(_, parts)| *parts)
                .ok_or_else(|| {
                    fail(
                        ty,
                        "Unable to determine the number of FFI components. \
                         Consider passing it to `gpu_kernel` like `#[gpu_kernel(Kernel1D, CUDA | DeviceSliceMut(2))]`",
                    )
                })?;

            Ok(KernelArg {
                ident,
                ty: ty.as_ref().clone(),
                ffi_parts,
            })
        })
        .collect()
}

fn inner_fn(input_fn: &ItemFn) -> ItemFn {
    let mut inner = input_fn.clone();
    inner.sig.ident = format_ident!("{}_inner", input_fn.sig.ident);
    inner.vis = parse_quote!(pub);
    inner.attrs.push(parse_quote!(#[inline(always)]));
    inner
}

/// `<name>_<arch>_kernel`: the device entry point `<name>_kernel`, which takes
/// every argument as its FFI components and reassembles them.
fn make_gpu_mod(
    input_fn: &ItemFn,
    arch: TargetType,
    args: &[KernelArg],
) -> Result<ItemMod, ProcMacFailure> {
    let ItemFn { vis, sig, .. } = input_fn;
    let mod_name = format_ident!("{}_{}_kernel", sig.ident, arch.as_str());
    let entry_name = format_ident!("{}_kernel", sig.ident);
    let inner = inner_fn(input_fn);
    let inner_name = &inner.sig.ident;

    let ffi_params = args.iter().flat_map(|arg| {
        arg.ffi_idents()
            .into_iter()
            .zip(arg.ffi_types())
            .map(|(id, ty)| quote! { #id: #ty })
    });
    let restructure = args.iter().map(|arg| {
        let KernelArg { ident, ty, .. } = arg;
        let parts = arg.ffi_idents();
        quote_spanned! {ident.span()=>
            let #ident = unsafe {
                <#ty as ::gpu_native::gpu_safety::GPUPassable>::from_ffi((#(#parts,)*))
            };
        }
    });
    let idents = args.iter().map(|arg| &arg.ident);

    Ok(parse_quote! {
        #[cfg(target_arch = "nvptx64")]
        #vis mod #mod_name {
            use super::*;

            #inner

            #[unsafe(no_mangle)]
            pub unsafe extern "ptx-kernel" fn #entry_name(#(#ffi_params,)*) {
                #(#restructure)*
                #inner_name(#(#idents,)*);
            }
        }
    })
}

/// `<name>`: the same body for host threads (`emulate`) and, with the
/// `cuda` feature, a launcher for the embedded fatbinary (`launch`).
fn make_host_mod(input_fn: &ItemFn, args: &[KernelArg]) -> Result<ItemMod, ProcMacFailure> {
    let ItemFn { vis, sig, .. } = input_fn;
    let fn_ident = &sig.ident;
    let inner = inner_fn(input_fn);
    let inner_name = &inner.sig.ident;

    let idents: Vec<_> = args.iter().map(|arg| &arg.ident).collect();
    let tys: Vec<_> = args.iter().map(|arg| &arg.ty).collect();
    let ffi_conversions = args.iter().map(|arg| {
        let KernelArg { ident, .. } = arg;
        let parts = arg.ffi_idents();
        let part_tys = arg.ffi_types();
        quote_spanned! {ident.span()=>
            let mut #ident = #ident;
            let (#(mut #parts,)*): (#(#part_tys,)*) =
                ::gpu_native::gpu_safety::GPUPassable::to_ffi(&mut #ident);
        }
    });
    let all_ffi_ids = args.iter().flat_map(KernelArg::ffi_idents);

    let entry_name = CString::new(format!("{fn_ident}_kernel"))
        .map_err(|_| fail(fn_ident, "Kernel names cannot contain null bytes."))?;
    let entry_name = LitCStr::new(&entry_name, fn_ident.span());

    Ok(parse_quote! {
        #[cfg(not(target_arch = "nvptx64"))]
        #vis mod #fn_ident {
            use super::*;

            #inner

            /// Runs the kernel on host threads.
            pub fn emulate(
                device: &::gpu_native::emulator::EmulatedDevice,
                grid_dim: ::gpu_native::thread_layout::GridDim1D,
                block_dim: ::gpu_native::thread_layout::BlockDim1D,
                #(#idents: #tys,)*
            ) -> Result<
                ::gpu_native::emulator::LaunchReport,
                ::gpu_native::emulator::LaunchError,
            > {
                device.launch_1d(grid_dim, block_dim, move || #inner_name(#(#idents,)*))
            }

            #[cfg(feature = "cuda")]
            mod device_code {
                use std::sync::LazyLock;
                use ::gpu_native::cuda::driver_wrapper::{CUDAKernel, CUDAModule};
                use ::gpu_native::cudarc::driver::{DriverError, sys::cudaError_enum};

                unsafe extern "Rust" {
                    #[link_name = concat!(env!("CARGO_PKG_NAME"), "_FATBIN_CODE_7B4EA9D2")]
                    static FATBIN_DATA: &'static [u8];
                }

                fn fatbin_data() -> Option<&'static [u8]> {
                    let arr = unsafe { FATBIN_DATA };
                    let magic = arr.get(..8)?.try_into().ok().map(u64::from_le_bytes)?;
                    (magic == ::gpu_native::build::FATBIN_MAGIC).then(|| &arr[8..])
                }

                static MODULE: LazyLock<Result<CUDAModule, DriverError>> = LazyLock::new(|| {
                    let fatbin = fatbin_data()
                        .ok_or(DriverError(cudaError_enum::CUDA_ERROR_INVALID_IMAGE))?;
                    unsafe { CUDAModule::from_fatbin(fatbin) }
                });

                pub static KERNEL: LazyLock<Result<CUDAKernel, DriverError>> = LazyLock::new(|| {
                    MODULE.as_ref().map_err(|e| *e)?.get_function(#entry_name)
                });
            }

            /// Enqueues the kernel on `stream`. Returns once the launch is
            /// queued, not once it finished.
            #[cfg(feature = "cuda")]
            pub fn launch(
                grid_dim: ::gpu_native::thread_layout::GridDim1D,
                block_dim: ::gpu_native::thread_layout::BlockDim1D,
                stream: &::gpu_native::cuda::driver_wrapper::CUDAStream,
                #(#idents: #tys,)*
            ) -> Result<(), ::gpu_native::cudarc::driver::DriverError> {
                let kernel = device_code::KERNEL.as_ref().map_err(|e| *e)?;
                #(#ffi_conversions)*

                let mut kernel_params = [
                    #(&mut #all_ffi_ids as *mut _ as *mut core::ffi::c_void,)*
                ];

                unsafe { kernel.launch_1d(grid_dim, block_dim, 0, stream, &mut kernel_params) }
            }
        }
    })
}

fn gpu_kernel_inner(attr: TokenStream, item: TokenStream) -> Result<TokenStream, ProcMacFailure> {
    let input_fn: ItemFn = syn::parse(item)?;
    check_signature(&input_fn.sig)?;

    let mut first_stmt = TokenStream::new();
    let mut second_stmt = TokenStream::new();
    let mut add_to_first = true;
    for v in attr.into_iter() {
        if let TokenTree::Punct(p) = &v {
            if *p == '|' {
                add_to_first = false;
                continue;
            }
        }
        if add_to_first {
            first_stmt.extend(TokenStream::from(v));
        } else {
            second_stmt.extend(TokenStream::from(v));
        }
    }

    let arch_kernel_types = syn::parse::Parser::parse(
        Punctuated::<Ident, syn::Token![,]>::parse_terminated,
        first_stmt,
    )?;

    let is_dim = |id: &&Ident| id.to_string().starts_with("Kernel");
    let kernel_dim_args: Vec<_> = arch_kernel_types.iter().filter(is_dim).collect();
    if let Some(extra) = kernel_dim_args.get(1) {
        return Err(fail(extra, "Cannot pass more than one kernel dimension!"));
    }
    if let Some(dim) = kernel_dim_args.first() {
        if *dim != "Kernel1D" {
            return Err(fail(dim, "Only `Kernel1D` kernels are supported."));
        }
    }

    let arch_compile = arch_kernel_types
        .iter()
        .filter(|id| !is_dim(id))
        .map(get_architecture)
        .collect::<Result<Vec<_>, _>>()?;
    if arch_compile.is_empty() {
        return Err(fail(
            &input_fn.sig.ident,
            &format!("Must provide one or more GPU types (right now, {GPU_TYPES})."),
        ));
    }

    let ffi_component_info = syn::parse::Parser::parse(
        Punctuated::<ExprCall, syn::Token![;]>::parse_terminated,
        second_stmt,
    )?;
    let mut ident_to_num_ffi = get_num_ffi_components(&ffi_component_info)?;
    ident_to_num_ffi.entry("u32".to_string()).or_insert(1);
    let args = get_kernel_args(&input_fn.sig, &ident_to_num_ffi)?;

    // We want a proc_macro2::TokenStream, not the proc_macro::TokenStream
    // which is visible in the crate.
    let mut output_token_stream = quote! {};
    for arch in arch_compile {
        output_token_stream.extend(make_gpu_mod(&input_fn, arch, &args)?.to_token_stream());
    }
    output_token_stream.extend(make_host_mod(&input_fn, &args)?.to_token_stream());

    Ok(output_token_stream.into())
}

/// Turns a free function into a 1D kernel.
///
/// ```ignore
/// #[gpu_kernel(Kernel1D, CUDA | DeviceSliceMut(2); DeviceSlice(2))]
/// pub fn scale(input: DeviceSlice<f32>, output: DeviceSliceMut<f32>) { ... }
/// ```
///
/// Before the `|` come the kernel dimension and the targets; after it, how
/// many FFI components each argument type decomposes into. On the device
/// this yields `scale_cuda_kernel::scale_kernel`; on the host a module
/// `scale` with `emulate` and (with the `cuda` feature) `launch`.
#[proc_macro_attribute]
pub fn gpu_kernel(attr: TokenStream, item: TokenStream) -> TokenStream {
    match gpu_kernel_inner(attr, item) {
        Ok(v) => v,
        Err(ProcMacFailure(v)) => v.into(),
    }
}

#[proc_macro_attribute]
pub fn host(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let item = syn::parse_macro_input!(item as Item);

    let output = quote! {
        #[cfg(not(any(target_arch = "nvptx64")))]
        #item
    };

    output.into()
}
