//! `mounter` library: guest-driven mount changes.

use std::sync::Arc;

use tracing::info;

use crate::computer::{ComputerHandle, HostContext};
use crate::value::Value;
use crate::vfs::Backing;

use super::{ApiError, Library, arg_bool, arg_str, opt};

pub fn library(ctx: &HostContext, computer: &ComputerHandle) -> Library {
    let (mount, unmount, list, read_only) =
        (computer.clone(), computer.clone(), computer.clone(), computer.clone());
    let ctx = ctx.clone();

    Library::new("mounter")
        .function("mount", move |args| {
            let at = arg_str(args, 0)?;
            let backing_text = arg_str(args, 1)?;
            let ro = opt(args, 2, arg_bool)?.unwrap_or(false);
            let shared = mount.upgrade().ok_or(ApiError::Gone)?;

            if ctx.config.show_mount_prompt {
                let ui = Arc::clone(&ctx.ui);
                let (id, text) = (mount.id(), backing_text.to_string());
                let allowed = ctx
                    .dispatcher
                    .submit(move || Ok(ui.confirm_mount(id, &text, ro)))
                    .map_err(|e| ApiError::Failed(e.to_string()))?;
                if !allowed {
                    return Err(ApiError::Failed("Mount declined".into()));
                }
            }

            let Ok(backing) = backing_text.parse::<Backing>();
            shared
                .fs()
                .mounts()
                .add(at, backing, ro, &ctx.images)?;
            info!(computer = mount.id(), path = at, backing = backing_text, read_only = ro, "guest mount");
            Ok(vec![Value::Bool(true)])
        })
        .function("unmount", move |args| {
            let at = arg_str(args, 0)?;
            let fs = unmount.fs().ok_or(ApiError::Gone)?;
            let removed = fs.mounts().remove(at)?;
            Ok(vec![Value::Bool(removed > 0)])
        })
        .function("list", move |_| {
            let mounts = list.mounts().ok_or(ApiError::Gone)?;
            Ok(vec![Value::list(mounts.into_iter().map(|m| {
                Value::Table(vec![
                    ("path".into(), Value::String(m.path)),
                    ("backing".into(), Value::String(m.backing)),
                    ("readOnly".into(), Value::Bool(m.read_only)),
                ])
            }))])
        })
        .function("isReadOnly", move |args| {
            let fs = read_only.fs().ok_or(ApiError::Gone)?;
            Ok(vec![fs.is_read_only(arg_str(args, 0)?)?.into()])
        })
}
