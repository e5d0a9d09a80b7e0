//! Helper macros for the dhcpcd process roles.

use convert_case::{Case, Casing};
use proc_macro2::TokenStream;
use quote::quote;
use syn::{parse_macro_input, ItemEnum, Lit, Meta};

/// Default user to drop privileges to.
const USERNAME: &str = "nobody";

#[proc_macro_derive(Privsep, attributes(username))]
pub fn derive_privsep(item: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(item as ItemEnum);

    derive_privsep_enum(input).into()
}

fn username(item: &ItemEnum) -> String {
    item.attrs
        .iter()
        .filter(|attr| attr.path.is_ident("username"))
        .filter_map(|attr| match attr.parse_meta() {
            Ok(Meta::NameValue(meta)) => match meta.lit {
                Lit::Str(name) => Some(name.value()),
                _ => None,
            },
            _ => None,
        })
        .last()
        .unwrap_or_else(|| USERNAME.to_string())
}

fn derive_privsep_enum(item: ItemEnum) -> TokenStream {
    let ident = item.ident.clone();
    let username = username(&item);
    let mut roles = vec![];
    let mut as_ref_str = vec![];
    let mut from_name = vec![];
    let mut from_id = vec![];

    for (id, variant) in item.variants.iter().enumerate() {
        let ident = &variant.ident;
        let name = ident.to_string().to_case(Case::Kebab);
        let id = id as u16;

        roles.push(quote! {
            Self::#ident,
        });

        as_ref_str.push(quote! {
            Self::#ident => #name,
        });

        from_name.push(quote! {
            #name => Some(Self::#ident),
        });

        from_id.push(quote! {
            #id => Ok(Self::#ident),
        });
    }
    let array_len = roles.len();
    let to_id = item.variants.iter().enumerate().map(|(id, variant)| {
        let variant = &variant.ident;
        let id = id as u16;
        quote! {
            #ident::#variant => #id,
        }
    });

    quote! {
        impl #ident {
            /// The user that unprivileged processes run as.
            pub const USERNAME: &'static str = #username;

            /// All roles in declaration order.
            pub const ROLES: [Self; #array_len] = [
                #(#roles)*
            ];

            /// Returns the process name of the role.
            pub fn name(&self) -> &'static str {
                match self {
                    #(#as_ref_str)*
                }
            }

            /// Looks up a role by its process name.
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    #(#from_name)*
                    _ => None,
                }
            }
        }

        impl AsRef<str> for #ident {
            fn as_ref(&self) -> &str {
                self.name()
            }
        }

        impl std::convert::TryFrom<u16> for #ident {
            type Error = &'static str;

            fn try_from(id: u16) -> Result<Self, Self::Error> {
                match id {
                    #(#from_id)*
                    _ => Err("Invalid privsep process ID"),
                }
            }
        }

        impl From<#ident> for u16 {
            fn from(role: #ident) -> u16 {
                match role {
                    #(#to_id)*
                }
            }
        }
    }
}
