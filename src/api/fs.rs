//! `fs` library.

use crate::computer::ComputerHandle;
use crate::value::Value;
use crate::vfs::SandboxFs;

use super::{ApiError, Library, arg_str};

fn bind<F>(computer: &ComputerHandle, f: F) -> impl Fn(&[Value]) -> Result<Vec<Value>, ApiError> + Send + Sync + 'static
where
    F: Fn(&SandboxFs, &[Value]) -> Result<Vec<Value>, ApiError> + Send + Sync + 'static,
{
    let computer = computer.clone();
    move |args| {
        let fs = computer.fs().ok_or(ApiError::Gone)?;
        f(&fs, args)
    }
}

fn names(items: Vec<String>) -> Value {
    Value::list(items.into_iter().map(Value::String))
}

pub fn library(computer: &ComputerHandle) -> Library {
    Library::new("fs")
        .function("list", bind(computer, |fs, args| Ok(vec![names(fs.list(arg_str(args, 0)?)?)])))
        .function("exists", bind(computer, |fs, args| Ok(vec![fs.exists(arg_str(args, 0)?).into()])))
        .function("isDir", bind(computer, |fs, args| Ok(vec![fs.is_dir(arg_str(args, 0)?).into()])))
        .function(
            "isReadOnly",
            bind(computer, |fs, args| Ok(vec![fs.is_read_only(arg_str(args, 0)?)?.into()])),
        )
        .function(
            "getSize",
            bind(computer, |fs, args| Ok(vec![Value::Integer(fs.size(arg_str(args, 0)?)? as i64)])),
        )
        .function(
            "getDrive",
            bind(computer, |fs, args| {
                Ok(vec![fs.drive(arg_str(args, 0)?).map_or(Value::Nil, Value::String)])
            }),
        )
        .function(
            "makeDir",
            bind(computer, |fs, args| {
                fs.make_dir(arg_str(args, 0)?)?;
                Ok(Vec::new())
            }),
        )
        .function(
            "delete",
            bind(computer, |fs, args| {
                fs.delete(arg_str(args, 0)?)?;
                Ok(Vec::new())
            }),
        )
        .function(
            "move",
            bind(computer, |fs, args| {
                fs.rename(arg_str(args, 0)?, arg_str(args, 1)?)?;
                Ok(Vec::new())
            }),
        )
        .function(
            "copy",
            bind(computer, |fs, args| {
                fs.copy(arg_str(args, 0)?, arg_str(args, 1)?)?;
                Ok(Vec::new())
            }),
        )
        .function("find", bind(computer, |fs, args| Ok(vec![names(fs.find(arg_str(args, 0)?)?)])))
        .function(
            "readAll",
            bind(computer, |fs, args| {
                let data = fs.read(arg_str(args, 0)?)?;
                Ok(vec![Value::String(String::from_utf8_lossy(&data).into_owned())])
            }),
        )
        .function(
            "write",
            bind(computer, |fs, args| {
                fs.write(arg_str(args, 0)?, arg_str(args, 1)?.as_bytes(), false)?;
                Ok(Vec::new())
            }),
        )
        .function(
            "append",
            bind(computer, |fs, args| {
                fs.write(arg_str(args, 0)?, arg_str(args, 1)?.as_bytes(), true)?;
                Ok(Vec::new())
            }),
        )
}
