//! D-Bus introspection model
//!
//! Introspection XML is read into a small element tree with `quick-xml` and
//! then turned into descriptors:
//!
//! - [`InterfaceModel`]: methods, signals and properties of one interface
//! - [`MethodDescriptor`]: arguments split by direction, declaration order kept
//! - [`SignalDescriptor`]: ordered signal arguments
//! - [`ArgumentDescriptor`]: one argument or property
//!
//! Only the subset of the introspection format needed to call methods and
//! route signals is read. Annotations and unknown elements are ignored.
//!
//! # Examples
//!
//! ```
//! use dbus_bridge_core::IntrospectionNode;
//!
//! let xml = r#"
//! <node>
//!   <interface name="com.example.Calc">
//!     <method name="Add">
//!       <arg name="a" type="i" direction="in"/>
//!       <arg name="b" type="i" direction="in"/>
//!       <arg name="result" type="i" direction="out"/>
//!     </method>
//!   </interface>
//!   <node name="child"/>
//! </node>"#;
//!
//! let node = IntrospectionNode::parse(xml).unwrap();
//! let calc = node.interface("com.example.Calc").unwrap();
//! let add = calc.method("Add").unwrap();
//! assert_eq!(add.in_args().count(), 2);
//! assert_eq!(node.children, vec!["child".to_string()]);
//! ```

use crate::error::{BridgeError, Result};
use crate::session::SchemaDataType;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

/// One XML element with its attributes and element children
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    /// Parse a document into its root element
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Introspection` for malformed XML, mismatched
    /// tags or a document without any element.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root = None;

        loop {
            match reader.read_event()? {
                Event::Start(start) => stack.push(Self::from_start(&start)?),
                Event::Empty(start) => {
                    let element = Self::from_start(&start)?;
                    Self::attach(&mut stack, &mut root, element);
                }
                Event::End(_) => {
                    let element = stack.pop().ok_or_else(|| {
                        BridgeError::Introspection("unexpected closing tag".to_string())
                    })?;
                    Self::attach(&mut stack, &mut root, element);
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if let Some(open) = stack.last() {
            return Err(BridgeError::Introspection(format!(
                "unclosed element <{}>",
                open.name
            )));
        }

        root.ok_or_else(|| BridgeError::Introspection("empty introspection data".to_string()))
    }

    fn from_start(start: &BytesStart<'_>) -> Result<Self> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut attributes = Vec::new();

        for attribute in start.attributes() {
            let attribute = attribute.map_err(|e| {
                BridgeError::Introspection(format!("bad attribute on <{}>: {}", name, e))
            })?;
            let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
            let value = attribute
                .unescape_value()
                .map_err(|e| {
                    BridgeError::Introspection(format!("bad value for attribute {}: {}", key, e))
                })?
                .into_owned();
            attributes.push((key, value));
        }

        Ok(Self {
            name,
            attributes,
            children: Vec::new(),
        })
    }

    fn attach(stack: &mut [XmlElement], root: &mut Option<XmlElement>, element: XmlElement) {
        match stack.last_mut() {
            Some(parent) => parent.children.push(element),
            None => {
                if root.is_none() {
                    *root = Some(element);
                }
            }
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |child| child.name == name)
    }
}

/// Direction of a method argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    /// Anything but `"out"` is an input argument
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("out") => Self::Out,
            _ => Self::In,
        }
    }
}

/// Access mode of a property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

impl Access {
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("read") => Self::ReadOnly,
            _ => Self::ReadWrite,
        }
    }
}

/// One argument or property declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentDescriptor {
    /// Declared name, or the zero-based position when unnamed
    pub name: String,
    pub signature: String,
    pub direction: Direction,
    pub access: Access,
}

impl ArgumentDescriptor {
    pub fn new(name: impl Into<String>, signature: impl Into<String>, direction: Direction) -> Self {
        Self {
            name: name.into(),
            signature: signature.into(),
            direction,
            access: Access::ReadWrite,
        }
    }

    /// Build from an `<arg>` or `<property>` element at `position` among its siblings
    pub fn from_element(element: &XmlElement, position: usize) -> Self {
        Self {
            name: element
                .attribute("name")
                .map(str::to_string)
                .unwrap_or_else(|| position.to_string()),
            signature: element.attribute("type").unwrap_or_default().to_string(),
            direction: Direction::parse(element.attribute("direction")),
            access: Access::parse(element.attribute("access")),
        }
    }

    pub fn data_type(&self) -> SchemaDataType {
        SchemaDataType::from_signature(&self.signature)
    }
}

/// A method with arguments split by direction
///
/// `in_args` and `out_args` index into `all_args`, so both keep
/// declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: String,
    all_args: Vec<ArgumentDescriptor>,
    in_args: Vec<usize>,
    out_args: Vec<usize>,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn from_element(element: &XmlElement) -> Result<Self> {
        let name = element
            .attribute("name")
            .ok_or_else(|| BridgeError::Introspection("method without a name".to_string()))?;

        let mut method = Self::new(name);
        for (position, arg) in element.children_named("arg").enumerate() {
            method.add_argument(ArgumentDescriptor::from_element(arg, position));
        }
        Ok(method)
    }

    /// Append an argument, sorting it into the IN or OUT list
    pub fn add_argument(&mut self, argument: ArgumentDescriptor) {
        let index = self.all_args.len();
        match argument.direction {
            Direction::In => self.in_args.push(index),
            Direction::Out => self.out_args.push(index),
        }
        self.all_args.push(argument);
    }

    pub fn all_args(&self) -> &[ArgumentDescriptor] {
        &self.all_args
    }

    pub fn in_args(&self) -> impl Iterator<Item = &ArgumentDescriptor> + '_ {
        self.in_args.iter().map(move |&i| &self.all_args[i])
    }

    pub fn out_args(&self) -> impl Iterator<Item = &ArgumentDescriptor> + '_ {
        self.out_args.iter().map(move |&i| &self.all_args[i])
    }

    pub fn in_count(&self) -> usize {
        self.in_args.len()
    }

    pub fn out_count(&self) -> usize {
        self.out_args.len()
    }
}

/// A signal and its ordered arguments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalDescriptor {
    pub name: String,
    pub args: Vec<ArgumentDescriptor>,
}

impl SignalDescriptor {
    pub fn from_element(element: &XmlElement) -> Result<Self> {
        let name = element
            .attribute("name")
            .ok_or_else(|| BridgeError::Introspection("signal without a name".to_string()))?;

        Ok(Self {
            name: name.to_string(),
            args: element
                .children_named("arg")
                .enumerate()
                .map(|(position, arg)| {
                    let mut arg = ArgumentDescriptor::from_element(arg, position);
                    arg.direction = Direction::Out;
                    arg
                })
                .collect(),
        })
    }
}

/// Methods, signals and properties of one interface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceModel {
    pub name: String,
    pub methods: Vec<MethodDescriptor>,
    pub signals: Vec<SignalDescriptor>,
    pub properties: Vec<ArgumentDescriptor>,
}

impl InterfaceModel {
    /// Build from one `<interface>` element, children read in document order
    pub fn from_element(element: &XmlElement) -> Result<Self> {
        let name = element
            .attribute("name")
            .ok_or_else(|| BridgeError::Introspection("interface without a name".to_string()))?;

        let mut model = Self {
            name: name.to_string(),
            ..Default::default()
        };

        for child in &element.children {
            match child.name.as_str() {
                "method" => model.methods.push(MethodDescriptor::from_element(child)?),
                "signal" => model.signals.push(SignalDescriptor::from_element(child)?),
                "property" => {
                    let position = model.properties.len();
                    model
                        .properties
                        .push(ArgumentDescriptor::from_element(child, position));
                }
                _ => {}
            }
        }

        Ok(model)
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn signal(&self, name: &str) -> Option<&SignalDescriptor> {
        self.signals.iter().find(|s| s.name == name)
    }

    pub fn property(&self, name: &str) -> Option<&ArgumentDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// One introspected object: its interfaces and the names of its child nodes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntrospectionNode {
    pub interfaces: Vec<InterfaceModel>,
    pub children: Vec<String>,
}

impl IntrospectionNode {
    pub fn parse(xml: &str) -> Result<Self> {
        let root = XmlElement::parse(xml)?;
        if root.name != "node" {
            return Err(BridgeError::Introspection(format!(
                "expected <node> root element, found <{}>",
                root.name
            )));
        }

        let interfaces = root
            .children_named("interface")
            .map(InterfaceModel::from_element)
            .collect::<Result<Vec<_>>>()?;

        let children = root
            .children_named("node")
            .filter_map(|node| node.attribute("name"))
            .map(str::to_string)
            .collect();

        Ok(Self {
            interfaces,
            children,
        })
    }

    pub fn interface(&self, name: &str) -> Option<&InterfaceModel> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    pub fn interface_names(&self) -> Vec<String> {
        self.interfaces.iter().map(|i| i.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const XML: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
 "http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
<node>
  <interface name="org.freedesktop.DBus.Introspectable">
    <method name="Introspect">
      <arg name="xml_data" type="s" direction="out"/>
    </method>
  </interface>
  <interface name="com.example.Calc">
    <method name="Divide">
      <arg name="a" type="i" direction="in"/>
      <arg name="quotient" type="i" direction="out"/>
      <arg name="b" type="i"/>
      <arg type="i" direction="out"/>
    </method>
    <signal name="Overflow">
      <arg name="operation" type="s"/>
      <arg type="x"/>
    </signal>
    <property name="Precision" type="u" access="read"/>
    <property name="Mode" type="s" access="readwrite">
      <annotation name="org.freedesktop.DBus.Property.EmitsChangedSignal" value="true"/>
    </property>
  </interface>
  <node name="sub"/>
  <node name="other"></node>
</node>"#;

    #[test]
    fn test_parse_node() {
        let node = IntrospectionNode::parse(XML).unwrap();
        assert_eq!(
            node.interface_names(),
            vec!["org.freedesktop.DBus.Introspectable", "com.example.Calc"]
        );
        assert_eq!(node.children, vec!["sub", "other"]);
    }

    #[test]
    fn test_method_argument_order() {
        let node = IntrospectionNode::parse(XML).unwrap();
        let divide = node.interface("com.example.Calc").unwrap().method("Divide").unwrap();

        let all: Vec<_> = divide.all_args().iter().map(|a| a.name.as_str()).collect();
        assert_eq!(all, vec!["a", "quotient", "b", "3"]);

        let ins: Vec<_> = divide.in_args().map(|a| a.name.as_str()).collect();
        assert_eq!(ins, vec!["a", "b"]);

        let outs: Vec<_> = divide.out_args().map(|a| a.name.as_str()).collect();
        assert_eq!(outs, vec!["quotient", "3"]);
        assert_eq!(divide.in_count(), 2);
        assert_eq!(divide.out_count(), 2);
    }

    #[test]
    fn test_signals_and_properties() {
        let node = IntrospectionNode::parse(XML).unwrap();
        let calc = node.interface("com.example.Calc").unwrap();

        let overflow = calc.signal("Overflow").unwrap();
        assert_eq!(overflow.args[1].name, "1");
        assert_eq!(overflow.args[1].signature, "x");

        let precision = calc.property("Precision").unwrap();
        assert_eq!(precision.access, Access::ReadOnly);
        assert_eq!(calc.property("Mode").unwrap().access, Access::ReadWrite);
        assert_eq!(precision.data_type(), SchemaDataType::Int);
    }

    #[test]
    fn test_lookup_misses_are_none() {
        let node = IntrospectionNode::parse(XML).unwrap();
        let calc = node.interface("com.example.Calc").unwrap();
        assert!(calc.method("Multiply").is_none());
        assert!(calc.signal("Underflow").is_none());
        assert!(calc.property("Scale").is_none());
        assert!(node.interface("com.example.Missing").is_none());
    }

    #[test]
    fn test_malformed_xml() {
        for xml in ["", "<node><interface name=\"a\"></node>", "<node>", "<interface/>"] {
            let result = IntrospectionNode::parse(xml);
            assert!(
                matches!(result, Err(BridgeError::Introspection(_))),
                "accepted {:?}",
                xml
            );
        }
    }

    #[test]
    fn test_nameless_interface_is_rejected() {
        let result = IntrospectionNode::parse("<node><interface/></node>");
        assert!(matches!(result, Err(BridgeError::Introspection(_))));
    }
}
