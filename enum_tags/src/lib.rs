use std::fmt;

use proc_macro::TokenStream;
use quote::quote;

enum Visibility {
    Public(proc_macro2::Span),
    Private,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public(..) => "public",
            Self::Private => "private",
        }
        .fmt(f)
    }
}

impl syn::parse::Parse for Visibility {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        let identifier = input.parse::<syn::Ident>()?;
        match identifier.to_string().as_str() {
            "public" => Ok(Self::Public(identifier.span())),
            "private" => Ok(Self::Private),
            _ => Err(syn::Error::new_spanned(
                identifier,
                "Unexpected visibility: expected `public` or `private`",
            )),
        }
    }
}

impl Visibility {
    fn into_syn(self) -> syn::Visibility {
        match self {
            Self::Public(span) => {
                syn::Visibility::Public(syn::token::Pub { span })
            }
            Self::Private => syn::Visibility::Inherited,
        }
    }
}

struct EnumTagsArgs {
    visibility: Visibility,
    repr_type: syn::Type,
}

impl syn::parse::Parse for EnumTagsArgs {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        mod kw {
            use syn::custom_keyword;

            custom_keyword!(repr);
        }

        let visibility = input.parse()?;

        input.parse::<syn::Token![,]>().map_err(|mut error| {
            error.combine(syn::Error::new(
                input.span(),
                format!("Missing comma after `{}` visibility", visibility),
            ));
            error
        })?;

        input.parse::<kw::repr>().map_err(|mut error| {
            error.combine(syn::Error::new(
                input.span(),
                format!("Missing `repr` after `{},`", visibility),
            ));
            error
        })?;

        let content;
        syn::parenthesized!(content in input);
        let repr_type = content.parse()?;

        Ok(Self {
            visibility,
            repr_type,
        })
    }
}

/// One variant after discriminant resolution.
struct TaggedVariant {
    name: syn::Ident,
    discriminant: usize,
    pattern: proc_macro2::TokenStream,
}

fn literal_discriminant(expr: &syn::Expr) -> syn::Result<usize> {
    match expr {
        syn::Expr::Lit(syn::ExprLit {
            lit: syn::Lit::Int(int_literal),
            ..
        }) => int_literal.base10_parse::<usize>(),
        other => Err(syn::Error::new_spanned(
            other,
            "Only literal discriminants are allowed",
        )),
    }
}

fn tag_variants(
    variants: impl Iterator<Item = syn::Variant>,
) -> syn::Result<Vec<TaggedVariant>> {
    let mut tagged = vec![];
    let mut discriminant = 0;

    for variant in variants {
        if let Some((_, custom_discriminant)) = &variant.discriminant {
            discriminant = literal_discriminant(custom_discriminant)?;
        }

        let name = variant.ident;
        let pattern = match variant.fields {
            syn::Fields::Named(_) => quote! { Self::#name { .. } },
            syn::Fields::Unnamed(_) => quote! { Self::#name(..) },
            syn::Fields::Unit => quote! { Self::#name },
        };

        tagged.push(TaggedVariant {
            name,
            discriminant,
            pattern,
        });

        discriminant += 1;
    }

    Ok(tagged)
}

fn impl_enum_tags(
    enum_visibility: syn::Visibility,
    enum_name: syn::Ident,
    repr_type: syn::Type,
    variants: Vec<TaggedVariant>,
) -> proc_macro2::TokenStream {
    let variant_count = variants.len();
    let mut tag_consts = vec![];
    let mut tag_cases = vec![];
    let mut name_cases = vec![];

    for TaggedVariant {
        name,
        discriminant,
        pattern,
    } in variants
    {
        let upper_name = name.to_string().to_ascii_uppercase();
        let tag_ident = quote::format_ident!("{}_TAG", upper_name);

        tag_consts.push(quote! {
            #[doc = concat!(
                "`#[enum_tags]`-generated tag for the variant `Self::",
                stringify!(#name),
                "`."
            )]
            #enum_visibility const #tag_ident: #repr_type = #discriminant as _;
        });
        tag_cases.push(quote! { #pattern => #discriminant as _ });
        name_cases.push(quote! { #pattern => #upper_name });
    }

    quote! {
        impl #enum_name {
            #(#tag_consts)*

            #[doc = "`#[enum_tags]`-generated number of variants."]
            #enum_visibility const VARIANT_COUNT: usize = #variant_count;

            #[doc = "`#[enum_tags]`-generated getter for this variant's tag."]
            #enum_visibility const fn tag(&self) -> #repr_type {
                match self {
                    #(#tag_cases),*
                }
            }

            #[doc = "`#[enum_tags]`-generated getter for this variant's \
                     upper-cased name."]
            #enum_visibility const fn tag_name(&self) -> &'static str {
                match self {
                    #(#name_cases),*
                }
            }
        }
    }
}

/// Constructs an `impl` for the given `enum` with constants for the
/// discriminant value of each variant, a `VARIANT_COUNT`, and getters for the
/// tag and the upper-cased variant name.
///
/// Usage examples:
///
/// * `#[enum_tags(public, repr(u8))]`
/// * `#[enum_tags(private, repr(u32))]`
///
/// Note that the `repr` type can be any numerical type to which a `usize` can
/// be casted to implicitly with the `as` keyword --- it is not the same as the
/// type for which you may `#[repr(...)]` the `enum`.
#[proc_macro_attribute]
pub fn enum_tags(args: TokenStream, input: TokenStream) -> TokenStream {
    let args = syn::parse_macro_input!(args as EnumTagsArgs);

    let input_item = syn::parse_macro_input!(input as syn::DeriveInput);
    let input_item_cloned = input_item.clone();

    let data_enum = match input_item.data {
        syn::Data::Enum(data_enum) => data_enum,
        syn::Data::Struct(syn::DataStruct {
            struct_token: syn::token::Struct { span },
            ..
        })
        | syn::Data::Union(syn::DataUnion {
            union_token: syn::token::Union { span },
            ..
        }) => {
            return syn::Error::new(span, "Item must be an `enum`")
                .into_compile_error()
                .into();
        }
    };

    let variants = match tag_variants(data_enum.variants.into_iter()) {
        Ok(variants) => variants,
        Err(error) => return error.into_compile_error().into(),
    };

    let tags_impl = impl_enum_tags(
        args.visibility.into_syn(),
        input_item.ident,
        args.repr_type,
        variants,
    );

    quote! {
        #input_item_cloned

        #tags_impl
    }
    .into()
}
