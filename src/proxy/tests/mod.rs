mod routing;
mod support;
