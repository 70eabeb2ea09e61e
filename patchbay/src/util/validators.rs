// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Error as AnyErr, Result};
use std::net::SocketAddr;

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)
    .map_err(|e| e.into())
    .and_then(|mut items| {
      items.nth(0).ok_or(AnyErr::msg(
        "No addresses were resolved from the given host",
      ))
    })
    .into()
}

pub fn parse_raw_fd(v: &str) -> Result<std::os::fd::RawFd> {
  v.parse::<std::os::fd::RawFd>()
    .map_err(|_| AnyErr::msg("Descriptor number was not a valid integer"))
    .and_then(|fd| {
      if fd < 0 {
        Err(AnyErr::msg("Descriptor number must not be negative"))
      } else {
        Ok(fd)
      }
    })
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_raw_fd(v: &str) -> Result<(), String> {
  parse_raw_fd(v).map(|_| ()).map_err(|e| e.to_string())
}
