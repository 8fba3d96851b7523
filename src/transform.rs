use failure::bail;

use crate::proto::{Code, Response};
use crate::{error, Acl, Stat};

pub(crate) fn create(
    res: Result<Response, Code>,
) -> Result<Result<String, error::Create>, failure::Error> {
    match res {
        Ok(Response::String(s)) => Ok(Ok(s)),
        Ok(r) => bail!("got non-string response to create: {:?}", r),
        Err(Code::NoNode) => Ok(Err(error::Create::NoNode)),
        Err(Code::NodeExists) => Ok(Err(error::Create::NodeExists)),
        Err(Code::InvalidAcl) => Ok(Err(error::Create::InvalidAcl)),
        Err(Code::NoChildrenForEphemerals) => Ok(Err(error::Create::NoChildrenForEphemerals)),
        Err(Code::NoAuth) => Ok(Err(error::Create::NoAuth)),
        Err(e) => bail!("create call failed: {:?}", e),
    }
}

pub(crate) fn delete(
    version: i32,
    res: Result<Response, Code>,
) -> Result<Result<(), error::Delete>, failure::Error> {
    match res {
        Ok(Response::Empty) => Ok(Ok(())),
        Ok(r) => bail!("got non-empty response to delete: {:?}", r),
        Err(Code::NoNode) => Ok(Err(error::Delete::NoNode)),
        Err(Code::NotEmpty) => Ok(Err(error::Delete::NotEmpty)),
        Err(Code::BadVersion) => Ok(Err(error::Delete::BadVersion { expected: version })),
        Err(Code::NoAuth) => Ok(Err(error::Delete::NoAuth)),
        Err(e) => bail!("delete call failed: {:?}", e),
    }
}

pub(crate) fn set_data(
    version: i32,
    res: Result<Response, Code>,
) -> Result<Result<Stat, error::SetData>, failure::Error> {
    match res {
        Ok(Response::Stat(stat)) => Ok(Ok(stat)),
        Ok(r) => bail!("got a non-stat response to a set_data request: {:?}", r),
        Err(Code::NoNode) => Ok(Err(error::SetData::NoNode)),
        Err(Code::BadVersion) => Ok(Err(error::SetData::BadVersion { expected: version })),
        Err(Code::NoAuth) => Ok(Err(error::SetData::NoAuth)),
        Err(e) => bail!("set_data call failed: {:?}", e),
    }
}

pub(crate) fn get_acl(
    res: Result<Response, Code>,
) -> Result<Result<(Vec<Acl>, Stat), error::GetAcl>, failure::Error> {
    match res {
        Ok(Response::GetAcl { acl, stat }) => Ok(Ok((acl, stat))),
        Ok(r) => bail!("got non-acl response to a get_acl request: {:?}", r),
        Err(Code::NoNode) => Ok(Err(error::GetAcl::NoNode)),
        Err(e) => bail!("get_acl call failed: {:?}", e),
    }
}

pub(crate) fn set_acl(
    version: i32,
    res: Result<Response, Code>,
) -> Result<Result<Stat, error::SetAcl>, failure::Error> {
    match res {
        Ok(Response::Stat(stat)) => Ok(Ok(stat)),
        Ok(r) => bail!("got non-stat response to a set_acl request: {:?}", r),
        Err(Code::NoNode) => Ok(Err(error::SetAcl::NoNode)),
        Err(Code::BadVersion) => Ok(Err(error::SetAcl::BadVersion { expected: version })),
        Err(Code::InvalidAcl) => Ok(Err(error::SetAcl::InvalidAcl)),
        Err(Code::NoAuth) => Ok(Err(error::SetAcl::NoAuth)),
        Err(e) => bail!("set_acl call failed: {:?}", e),
    }
}

pub(crate) fn exists(res: Result<Response, Code>) -> Result<Option<Stat>, failure::Error> {
    match res {
        Ok(Response::Stat(stat)) => Ok(Some(stat)),
        Ok(r) => bail!("got a non-stat response to an exists request: {:?}", r),
        Err(Code::NoNode) => Ok(None),
        Err(e) => bail!("exists call failed: {:?}", e),
    }
}

pub(crate) fn get_children(
    res: Result<Response, Code>,
) -> Result<Option<Vec<String>>, failure::Error> {
    match res {
        Ok(Response::Strings(children)) => Ok(Some(children)),
        Ok(r) => bail!("got non-strings response to get-children: {:?}", r),
        Err(Code::NoNode) => Ok(None),
        Err(e) => bail!("get-children call failed: {:?}", e),
    }
}

pub(crate) fn get_data(
    res: Result<Response, Code>,
) -> Result<Option<(Vec<u8>, Stat)>, failure::Error> {
    match res {
        Ok(Response::GetData { bytes, stat }) => Ok(Some((bytes, stat))),
        Ok(r) => bail!("got non-data response to get-data: {:?}", r),
        Err(Code::NoNode) => Ok(None),
        Err(e) => bail!("get-data call failed: {:?}", e),
    }
}
